//! Synthetic code-block fixtures shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;

use j2k_pcrd::jpeg2000::emitter::TilePart;
use j2k_pcrd::{
    CodeBlock, CodestreamParams, ComponentParams, LayerSpec, PrecinctRef, ProgressionOrder, RateControlConfig,
    RateControlContext, SubbandBlocks, SubbandOrientation,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Code-blocks per subband side in every fixture precinct.
pub const GRID: usize = 2;

/// 32x32 single component, two resolutions: four 16x16 precincts at full
/// resolution, one at the lowest.
pub fn two_resolution_params(layers: u16, order: ProgressionOrder) -> CodestreamParams {
    CodestreamParams::single_tile(
        32,
        32,
        vec![ComponentParams::new(1, 1, 1).with_precincts(vec![(4, 4)])],
        layers,
        order,
    )
}

/// A 20-pass block whose slopes interleave with every other block's, so
/// each threshold step adds one pass of 6 to 10 bytes.
pub fn interleaved_block(id: usize) -> CodeBlock {
    let mut pairs = vec![(0u32, 0u16)];
    let mut length = 0;
    for k in 1..=20u32 {
        length += 6 + (k * 7 + id as u32 * 3) % 5;
        pairs.push((length, (60000 - k * 1000 - id as u32 * 15) as u16));
    }
    CodeBlock::from_pairs(&pairs, 0).unwrap()
}

/// A block with random lengths and slopes.
pub fn random_block(rng: &mut StdRng) -> CodeBlock {
    let passes = rng.random_range(1..=24);
    let mut slope: u16 = rng.random_range(20000..=60000);
    let mut length = 0u32;
    let mut pairs = vec![(0, 0)];
    for _ in 0..passes {
        length += rng.random_range(0..=30);
        slope -= rng.random_range(1..=700);
        pairs.push((length, slope));
    }
    CodeBlock::from_pairs(&pairs, rng.random_range(0..3)).unwrap()
}

pub fn all_precincts(ctx: &RateControlContext) -> Vec<PrecinctRef> {
    let mut refs = Vec::new();
    for tile in ctx.tiles() {
        for comp in &tile.components {
            for res in &comp.resolutions {
                for i in 0..res.num_precincts() {
                    refs.push(PrecinctRef::new(tile.index, comp.index, res.index as usize, i));
                }
            }
        }
    }
    refs
}

pub fn subbands_with(precinct: PrecinctRef, mut block: impl FnMut() -> CodeBlock) -> Vec<SubbandBlocks> {
    SubbandOrientation::for_resolution(precinct.resolution)
        .iter()
        .map(|&o| {
            let blocks = (0..GRID * GRID).map(|_| block()).collect();
            SubbandBlocks::new(o, GRID, GRID, blocks).unwrap()
        })
        .collect()
}

/// Installs interleaved blocks into every precinct.
pub fn fill_interleaved(ctx: &mut RateControlContext) {
    let mut id = 0;
    for precinct in all_precincts(ctx) {
        let subbands = subbands_with(precinct, || {
            id += 1;
            interleaved_block(id - 1)
        });
        ctx.submit_precinct(precinct, subbands).unwrap();
    }
}

/// Installs random blocks into every precinct.
pub fn fill_random(ctx: &mut RateControlContext, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    for precinct in all_precincts(ctx) {
        let subbands = subbands_with(precinct, || random_block(&mut rng));
        ctx.submit_precinct(precinct, subbands).unwrap();
    }
}

pub fn context(params: &CodestreamParams, spec: LayerSpec, tolerance: f64) -> RateControlContext {
    let config = RateControlConfig {
        tolerance,
        ..RateControlConfig::default()
    };
    RateControlContext::new(params, spec, config).unwrap()
}

/// Packet layers per precinct, in emission order.
pub fn layers_by_precinct(parts: &[TilePart]) -> HashMap<PrecinctRef, Vec<u16>> {
    let mut seen: HashMap<PrecinctRef, Vec<u16>> = HashMap::new();
    for part in parts {
        for packet in &part.packets {
            seen.entry(packet.precinct).or_default().push(packet.layer);
        }
    }
    seen
}
