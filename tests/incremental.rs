//! Incremental flushing and concurrent precinct submission.

mod common;

use std::collections::BTreeMap;
use std::thread;

use common::*;
use j2k_pcrd::jpeg2000::emitter::TilePart;
use j2k_pcrd::{
    CodestreamParams, ComponentParams, FlushOutcome, LayerSpec, PrecinctRef, ProgressionOrder, RateControlConfig,
    RateControlContext, SharedCodestream,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// 64x64, one decomposition level, 8x8 precincts at both resolutions.
fn striped_params(order: ProgressionOrder, layers: u16) -> CodestreamParams {
    CodestreamParams::single_tile(
        64,
        64,
        vec![ComponentParams::new(1, 1, 1).with_precincts(vec![(3, 3)])],
        layers,
        order,
    )
}

/// Precincts grouped by the reference-grid row where they end.
fn stripes(ctx: &RateControlContext) -> Vec<Vec<PrecinctRef>> {
    let mut rows: BTreeMap<u64, Vec<PrecinctRef>> = BTreeMap::new();
    for precinct in all_precincts(ctx) {
        let tile = &ctx.tiles()[precinct.tile];
        let comp = &tile.components[precinct.component];
        let res = &comp.resolutions[precinct.resolution];
        let bottom = (res.precinct_rect(precinct.index).y1 as u64) << (comp.levels - res.index);
        rows.entry(bottom).or_default().push(precinct);
    }
    rows.into_values().collect()
}

fn drain_flushes(ctx: &mut RateControlContext, parts: &mut Vec<TilePart>) {
    for _ in 0..8 {
        match ctx.flush().unwrap() {
            FlushOutcome::Flushed { tile_parts, .. } => parts.extend(tile_parts),
            FlushOutcome::Complete => return,
            FlushOutcome::Deferred => panic!("deferred with every precinct delivered"),
        }
    }
    panic!("flushing never completed");
}

#[test]
fn test_stripe_flushes_emit_everything_in_order() {
    let params = striped_params(ProgressionOrder::PositionComponentResolutionLayer, 2);
    let mut ctx = context(&params, LayerSpec::Sizes(vec![1500, 6000]), 0.05);
    let mut rng = StdRng::seed_from_u64(11);
    let mut parts = Vec::new();
    let mut previous_bytes = vec![0u64; 2];
    let mut flushed = 0;

    for stripe in stripes(&ctx) {
        let submitter = ctx.submitter();
        for precinct in stripe {
            submitter.submit(precinct, subbands_with(precinct, || random_block(&mut rng))).unwrap();
        }
        if let FlushOutcome::Flushed { tile_parts, .. } = ctx.flush().unwrap() {
            flushed += 1;
            parts.extend(tile_parts);
        }
        // Committed layer sizes only grow.
        for (now, before) in ctx.layer_bytes().iter().zip(&previous_bytes) {
            assert!(now >= before);
        }
        previous_bytes = ctx.layer_bytes().to_vec();
    }
    drain_flushes(&mut ctx, &mut parts);

    assert!(flushed > 1);
    assert!(ctx.is_complete());
    let indices: Vec<u8> = parts.iter().map(|p| p.index).collect();
    assert_eq!(indices, (0..parts.len() as u8).collect::<Vec<_>>());

    let seen = layers_by_precinct(&parts);
    assert_eq!(seen.len(), all_precincts(&ctx).len());
    assert!(seen.values().all(|layers| layers == &vec![0, 1]));

    let payload: usize = parts.iter().flat_map(|p| &p.packets).map(|p| p.len).sum();
    assert_eq!(payload as u64, ctx.layer_bytes().iter().sum::<u64>());
    assert!(ctx.layer_bytes().iter().sum::<u64>() <= 6000);
}

#[test]
fn test_flush_defers_until_lower_rows_are_covered() {
    let params = striped_params(ProgressionOrder::ResolutionPositionComponentLayer, 1);
    let mut ctx = context(&params, LayerSpec::Slopes(vec![0]), 0.02);
    let stripes = stripes(&ctx);
    let mut rng = StdRng::seed_from_u64(5);

    // The first stripe holds only full-resolution precincts ending at row 8;
    // the lowest resolution's first row reaches row 16.
    assert!(stripes[0].iter().all(|p| p.resolution == 1));
    for &precinct in &stripes[0] {
        ctx.submit_precinct(precinct, subbands_with(precinct, || random_block(&mut rng))).unwrap();
    }
    assert!(!ctx.ready_for_flush());
    assert_eq!(ctx.flush().unwrap(), FlushOutcome::Deferred);

    for &precinct in &stripes[1] {
        ctx.submit_precinct(precinct, subbands_with(precinct, || random_block(&mut rng))).unwrap();
    }
    assert!(ctx.ready_for_flush());
    match ctx.flush().unwrap() {
        // Resolution-major: the lowest resolution's first row goes out.
        FlushOutcome::Flushed { tile_parts, .. } => {
            assert!(tile_parts[0].packets.iter().all(|p| p.precinct.resolution == 0));
            assert_eq!(tile_parts[0].packets.len(), 4);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_workers_submit_while_flushing() {
    let params = striped_params(ProgressionOrder::LayerResolutionComponentPosition, 2);
    let shared = SharedCodestream::new(&params, LayerSpec::Slopes(vec![40000, 0]), RateControlConfig::default())
        .unwrap();
    let mut precincts = all_precincts(&shared.lock());
    precincts.shuffle(&mut StdRng::seed_from_u64(3));

    let workers: Vec<_> = precincts
        .chunks(precincts.len().div_ceil(4))
        .enumerate()
        .map(|(w, chunk)| {
            let submitter = shared.submitter();
            let chunk = chunk.to_vec();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(w as u64);
                for precinct in chunk {
                    submitter.submit(precinct, subbands_with(precinct, || random_block(&mut rng))).unwrap();
                }
            })
        })
        .collect();

    let mut parts = Vec::new();
    while workers.iter().any(|w| !w.is_finished()) {
        if let Some(FlushOutcome::Flushed { tile_parts, .. }) = shared.try_flush_nonblocking().transpose().unwrap() {
            parts.extend(tile_parts);
        }
        thread::yield_now();
    }
    for worker in workers {
        worker.join().unwrap();
    }
    drain_flushes(&mut shared.lock(), &mut parts);

    let ctx = shared.into_inner().ok().unwrap();
    assert!(ctx.is_complete());
    let seen = layers_by_precinct(&parts);
    assert_eq!(seen.len(), precincts.len());
    assert!(seen.values().all(|layers| layers == &vec![0, 1]));
}
