//! Packet sequencing across the five progression orders.

mod common;

use common::*;
use j2k_pcrd::jpeg2000::progression::Sequencer;
use j2k_pcrd::{
    CodestreamParams, ComponentParams, LayerSpec, PcrdError, ProgressionChange, ProgressionOrder, RateControlConfig,
    RateControlContext,
};
use proptest::prelude::*;

const ORDERS: [ProgressionOrder; 5] = [
    ProgressionOrder::LayerResolutionComponentPosition,
    ProgressionOrder::ResolutionLayerComponentPosition,
    ProgressionOrder::ResolutionPositionComponentLayer,
    ProgressionOrder::PositionComponentResolutionLayer,
    ProgressionOrder::ComponentPositionResolutionLayer,
];

/// Two components, the second subsampled by two, with uneven precinct
/// grids and an image origin off the grid.
fn mixed_params(order: ProgressionOrder, layers: u16) -> CodestreamParams {
    let mut params = CodestreamParams::single_tile(
        0,
        0,
        vec![
            ComponentParams::new(1, 1, 2).with_precincts(vec![(4, 4), (3, 3)]),
            ComponentParams::new(2, 2, 1).with_precincts(vec![(3, 3)]),
        ],
        layers,
        order,
    );
    params.image = j2k_pcrd::Rect::new(3, 5, 75, 61);
    params
}

#[test]
fn test_every_order_emits_every_packet_once() {
    for order in ORDERS {
        let params = mixed_params(order, 3);
        let mut ctx = context(&params, LayerSpec::Slopes(vec![50000, 40000, 0]), 0.02);
        fill_random(&mut ctx, 7);
        let relevant: u64 = ctx.tiles().iter().map(|t| t.relevant_packets()).sum();
        let precincts = all_precincts(&ctx);

        let out = ctx.emit_sequential().unwrap();
        let emitted: usize = out.tile_parts.iter().map(|tp| tp.packets.len()).sum();
        assert_eq!(emitted as u64, relevant, "{order}");
        assert_eq!(relevant, precincts.len() as u64 * 3);

        let seen = layers_by_precinct(&out.tile_parts);
        assert_eq!(seen.len(), precincts.len(), "{order}");
        for layers in seen.values() {
            assert_eq!(layers, &vec![0, 1, 2], "{order}");
        }
    }
}

#[test]
fn test_layer_order_is_outermost_for_lrcp() {
    let params = mixed_params(ProgressionOrder::LayerResolutionComponentPosition, 2);
    let mut ctx = context(&params, LayerSpec::Slopes(vec![30000, 0]), 0.02);
    fill_random(&mut ctx, 3);
    let out = ctx.emit_sequential().unwrap();
    let layers: Vec<u16> = out.tile_parts[0].packets.iter().map(|p| p.layer).collect();
    assert!(layers.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn test_resolution_order_is_outermost_for_rpcl() {
    let params = mixed_params(ProgressionOrder::ResolutionPositionComponentLayer, 2);
    let mut ctx = context(&params, LayerSpec::Slopes(vec![30000, 0]), 0.02);
    fill_random(&mut ctx, 3);
    let out = ctx.emit_sequential().unwrap();
    let resolutions: Vec<usize> = out.tile_parts[0].packets.iter().map(|p| p.precinct.resolution).collect();
    assert!(resolutions.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn test_component_order_is_outermost_for_cprl() {
    let params = mixed_params(ProgressionOrder::ComponentPositionResolutionLayer, 2);
    let mut ctx = context(&params, LayerSpec::Slopes(vec![30000, 0]), 0.02);
    fill_random(&mut ctx, 3);
    let out = ctx.emit_sequential().unwrap();
    let components: Vec<usize> = out.tile_parts[0].packets.iter().map(|p| p.precinct.component).collect();
    assert!(components.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn test_spatial_orders_need_power_of_two_subsampling() {
    for order in ORDERS {
        let params = CodestreamParams::single_tile(
            30,
            30,
            vec![ComponentParams::new(1, 1, 1), ComponentParams::new(3, 3, 1)],
            1,
            order,
        );
        let result = RateControlContext::new(&params, LayerSpec::Slopes(vec![0]), RateControlConfig::default());
        if order.requires_common_grid() {
            assert_eq!(result.err(), Some(PcrdError::NonPowerOfTwoSubsampling), "{order}");
        } else {
            assert!(result.is_ok(), "{order}");
        }
    }
}

#[test]
fn test_progression_changes_split_the_tile() {
    let mut params = two_resolution_params(2, ProgressionOrder::LayerResolutionComponentPosition);
    params.progression_changes = vec![
        // Lowest resolution first, all layers.
        ProgressionChange {
            order: ProgressionOrder::ResolutionLayerComponentPosition,
            layer_end: 2,
            resolution_start: 0,
            resolution_end: 1,
            component_start: 0,
            component_end: 1,
        },
        // Then the rest, layer by layer.
        ProgressionChange::full(ProgressionOrder::LayerResolutionComponentPosition, 2, 2, 1),
    ];
    let mut ctx = context(&params, LayerSpec::Slopes(vec![50000, 0]), 0.02);
    fill_interleaved(&mut ctx);
    let out = ctx.emit_sequential().unwrap();

    let order: Vec<(usize, u16)> = out.tile_parts[0]
        .packets
        .iter()
        .map(|p| (p.precinct.resolution, p.layer))
        .collect();
    assert_eq!(&order[..2], &[(0, 0), (0, 1)]);
    assert!(order[2..6].iter().all(|&(r, l)| r == 1 && l == 0));
    assert!(order[6..].iter().all(|&(r, l)| r == 1 && l == 1));
}

#[test]
fn test_speculative_lookahead_restores() {
    let params = two_resolution_params(1, ProgressionOrder::ResolutionPositionComponentLayer);
    let mut ctx = context(&params, LayerSpec::Slopes(vec![0]), 0.02);
    fill_interleaved(&mut ctx);
    ctx.allocate_layers().unwrap();

    let tile = &ctx.tiles()[0];
    let mut sequencer = Sequencer::new(tile).unwrap();
    let saved = sequencer.save_state();
    let mut ahead = Vec::new();
    while let Some(next) = sequencer.next_in_sequence(tile) {
        ahead.push(next);
    }
    assert_eq!(ahead.len(), 5);
    sequencer.restore_state(saved);
    assert_eq!(sequencer.next_in_sequence(tile), Some(ahead[0]));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]
    #[test]
    fn prop_totals_do_not_depend_on_order(seed in any::<u64>(), high in 20000u16..60000) {
        let mut totals = Vec::new();
        for order in ORDERS {
            let params = mixed_params(order, 2);
            let mut ctx = context(&params, LayerSpec::Slopes(vec![high, 0]), 0.02);
            fill_random(&mut ctx, seed);
            let out = ctx.emit_sequential().unwrap();
            let per_layer: Vec<u64> = out.layers.iter().map(|l| l.cumulative_bytes).collect();
            let bytes: usize = out.tile_parts.iter().map(|tp| tp.bytes.len()).sum();
            totals.push((per_layer, bytes));
        }
        for other in &totals[1..] {
            prop_assert_eq!(other, &totals[0]);
        }
    }
}
