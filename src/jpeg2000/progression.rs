//! Packet progression: the five progression orders of ISO/IEC 15444-1
//! (B.12) and progression order change records.

use std::fmt;
use std::str::FromStr;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::image::Tile;
use super::precinct::PrecinctRef;
use crate::error::PcrdError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ProgressionOrder {
    LayerResolutionComponentPosition = 0,
    ResolutionLayerComponentPosition = 1,
    ResolutionPositionComponentLayer = 2,
    PositionComponentResolutionLayer = 3,
    ComponentPositionResolutionLayer = 4,
}

impl ProgressionOrder {
    pub fn from_code(code: u8) -> Result<Self, PcrdError> {
        Self::try_from(code).map_err(|_| PcrdError::InvalidProgressionOrder)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LayerResolutionComponentPosition => "LRCP",
            Self::ResolutionLayerComponentPosition => "RLCP",
            Self::ResolutionPositionComponentLayer => "RPCL",
            Self::PositionComponentResolutionLayer => "PCRL",
            Self::ComponentPositionResolutionLayer => "CPRL",
        }
    }

    /// Loop nesting, outermost first.
    fn axes(self) -> [Axis; 4] {
        use Axis::*;
        match self {
            Self::LayerResolutionComponentPosition => [Layer, Resolution, Component, Position],
            Self::ResolutionLayerComponentPosition => [Resolution, Layer, Component, Position],
            Self::ResolutionPositionComponentLayer => [Resolution, Position, Component, Layer],
            Self::PositionComponentResolutionLayer => [Position, Component, Resolution, Layer],
            Self::ComponentPositionResolutionLayer => [Component, Position, Resolution, Layer],
        }
    }

    /// Orders that walk positions on the reference grid rather than
    /// precinct indices.
    pub fn is_spatial(self) -> bool {
        self.axes()[3] != Axis::Position
    }

    /// Orders whose position loop is shared by several components.
    pub fn requires_common_grid(self) -> bool {
        matches!(
            self,
            Self::ResolutionPositionComponentLayer | Self::PositionComponentResolutionLayer
        )
    }

    fn depth(self, axis: Axis) -> usize {
        self.axes().iter().position(|&a| a == axis).unwrap_or(0)
    }
}

impl fmt::Display for ProgressionOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProgressionOrder {
    type Err = PcrdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LRCP" => Ok(Self::LayerResolutionComponentPosition),
            "RLCP" => Ok(Self::ResolutionLayerComponentPosition),
            "RPCL" => Ok(Self::ResolutionPositionComponentLayer),
            "PCRL" => Ok(Self::PositionComponentResolutionLayer),
            "CPRL" => Ok(Self::ComponentPositionResolutionLayer),
            _ => Err(PcrdError::InvalidProgressionOrder),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Layer,
    Resolution,
    Component,
    Position,
}

/// A progression order change record. Start bounds are inclusive, end
/// bounds exclusive; ends beyond what the tile has are clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressionChange {
    pub order: ProgressionOrder,
    pub layer_end: u16,
    pub resolution_start: u8,
    pub resolution_end: u8,
    pub component_start: u16,
    pub component_end: u16,
}

impl ProgressionChange {
    /// A record spanning every layer, resolution and component.
    pub fn full(order: ProgressionOrder, num_layers: u16, num_resolutions: u8, num_components: u16) -> Self {
        Self {
            order,
            layer_end: num_layers,
            resolution_start: 0,
            resolution_end: num_resolutions,
            component_start: 0,
            component_end: num_components,
        }
    }

    pub fn validate(&self) -> Result<(), PcrdError> {
        if self.layer_end == 0
            || self.resolution_start >= self.resolution_end
            || self.component_start >= self.component_end
        {
            log::error!("empty progression change record {:?}", self);
            return Err(PcrdError::InvalidProgressionChange);
        }
        Ok(())
    }
}

/// A position in the progression. For spatial orders `x`/`y` are reference
/// grid coordinates, otherwise `index` is a precinct index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub x: u64,
    pub y: u64,
    pub index: usize,
}

/// Snapshot of a sequencer, used to look ahead without committing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressionState {
    pub change_idx: usize,
    pub layer: u16,
    pub resolution: usize,
    pub component: usize,
    pub position: Position,
    active: bool,
    step: (u64, u64),
}

impl Default for ProgressionState {
    fn default() -> Self {
        Self {
            change_idx: 0,
            layer: 0,
            resolution: 0,
            component: 0,
            position: Position::default(),
            active: false,
            step: (1, 1),
        }
    }
}

/// How the progression should treat a visited (precinct, layer) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// Already sequenced, or nothing to send.
    Skip,
    /// The packet is formed and next in line.
    Yield,
    /// The packet cannot be sent yet; the progression must wait here.
    Block,
}

pub trait PacketAvailability {
    fn visit(&self, precinct: PrecinctRef, layer: u16) -> Visit;
}

impl PacketAvailability for Tile {
    fn visit(&self, precinct: PrecinctRef, layer: u16) -> Visit {
        let Some(res) = self.resolution(precinct.component, precinct.resolution) else {
            return Visit::Skip;
        };
        if layer >= self.num_layers || precinct.index >= res.num_precincts() {
            return Visit::Skip;
        }
        let next = res.next_layer_idx(precinct.index);
        if next > layer {
            Visit::Skip
        } else if next < layer {
            Visit::Block
        } else if res.precinct(precinct.index).is_some_and(|p| p.has_packet(layer)) {
            Visit::Yield
        } else {
            Visit::Block
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencedPacket {
    pub precinct: PrecinctRef,
    pub layer: u16,
}

#[derive(Debug, Clone, Copy)]
struct Bounds {
    layer_end: u16,
    res_start: usize,
    res_end: usize,
    comp_start: usize,
    comp_end: usize,
}

/// Walks the packets of one tile in progression order, across any number of
/// progression change records.
#[derive(Debug, Clone)]
pub struct Sequencer {
    tile: usize,
    changes: Vec<ProgressionChange>,
    state: ProgressionState,
}

impl Sequencer {
    pub fn new(tile: &Tile) -> Result<Self, PcrdError> {
        let changes = if tile.progression_changes.is_empty() {
            let resolutions = tile
                .components
                .iter()
                .map(|c| c.levels as u16 + 1)
                .max()
                .unwrap_or(1);
            vec![ProgressionChange::full(
                tile.order,
                tile.num_layers,
                resolutions.min(u8::MAX as u16) as u8,
                tile.components.len() as u16,
            )]
        } else {
            tile.progression_changes.clone()
        };
        for change in &changes {
            Self::validate_change(change, tile)?;
        }
        Ok(Self {
            tile: tile.index,
            changes,
            state: ProgressionState::default(),
        })
    }

    fn validate_change(change: &ProgressionChange, tile: &Tile) -> Result<(), PcrdError> {
        change.validate()?;
        if change.order.requires_common_grid() {
            let end = (change.component_end as usize).min(tile.components.len());
            for comp in tile.components.iter().take(end).skip(change.component_start as usize) {
                if !comp.dx.is_power_of_two() || !comp.dy.is_power_of_two() {
                    log::error!(
                        "{} needs power-of-two subsampling, component {} has {}x{}",
                        change.order,
                        comp.index,
                        comp.dx,
                        comp.dy
                    );
                    return Err(PcrdError::NonPowerOfTwoSubsampling);
                }
            }
        }
        Ok(())
    }

    /// Appends a progression change record. Sequencing continues into it
    /// once the earlier records are exhausted.
    pub fn append_progression(&mut self, change: ProgressionChange, tile: &Tile) -> Result<(), PcrdError> {
        Self::validate_change(&change, tile)?;
        self.changes.push(change);
        Ok(())
    }

    pub fn changes(&self) -> &[ProgressionChange] {
        &self.changes
    }

    pub fn save_state(&self) -> ProgressionState {
        self.state
    }

    pub fn restore_state(&mut self, state: ProgressionState) {
        self.state = state;
    }

    pub fn next_in_sequence(&mut self, tile: &Tile) -> Option<SequencedPacket> {
        if tile.is_complete() {
            return None;
        }
        self.next_in_sequence_with(tile, tile)
    }

    /// Returns the next (precinct, layer) whose packet can be sent, or None
    /// when the progression is blocked on a packet that is not yet formed or
    /// every change record is exhausted. Blocking leaves the state untouched.
    pub fn next_in_sequence_with<A: PacketAvailability + ?Sized>(
        &mut self,
        tile: &Tile,
        availability: &A,
    ) -> Option<SequencedPacket> {
        debug_assert_eq!(tile.index, self.tile);
        loop {
            if !self.state.active {
                if self.state.change_idx >= self.changes.len() {
                    return None;
                }
                if self.start(tile) {
                    self.state.active = true;
                } else {
                    self.state.change_idx += 1;
                    continue;
                }
            }

            let layer = self.state.layer;
            let visit = self
                .current_precinct(tile)
                .map(|p| (p, availability.visit(p, layer)));
            match visit {
                None | Some((_, Visit::Skip)) => self.step(tile),
                Some((precinct, Visit::Yield)) => {
                    self.step(tile);
                    return Some(SequencedPacket { precinct, layer });
                }
                Some((_, Visit::Block)) => return None,
            }
        }
    }

    /// Next packet without advancing.
    pub fn peek(&mut self, tile: &Tile) -> Option<SequencedPacket> {
        let saved = self.save_state();
        let next = self.next_in_sequence(tile);
        self.restore_state(saved);
        next
    }

    fn change(&self) -> &ProgressionChange {
        &self.changes[self.state.change_idx]
    }

    fn bounds(&self, tile: &Tile) -> Bounds {
        let change = self.change();
        let comp_end = (change.component_end as usize).min(tile.components.len());
        let comp_start = change.component_start as usize;
        let max_res = if change.order.depth(Axis::Component) < change.order.depth(Axis::Resolution) {
            tile.components
                .get(self.state.component)
                .map_or(0, |c| c.levels as usize + 1)
        } else {
            tile.components[comp_start.min(comp_end)..comp_end]
                .iter()
                .map(|c| c.levels as usize + 1)
                .max()
                .unwrap_or(0)
        };
        Bounds {
            layer_end: change.layer_end.min(tile.num_layers),
            res_start: change.resolution_start as usize,
            res_end: (change.resolution_end as usize).min(max_res),
            comp_start,
            comp_end,
        }
    }

    fn step(&mut self, tile: &Tile) {
        if !self.advance_from(3, tile) {
            self.state.active = false;
            self.state.change_idx += 1;
        }
    }

    fn start(&mut self, tile: &Tile) -> bool {
        match self.reset_from(0, tile) {
            None => true,
            Some(0) => false,
            Some(k) => self.advance_from(k - 1, tile),
        }
    }

    /// Resets the axes at depth `from` and deeper; returns the first one
    /// with an empty range.
    fn reset_from(&mut self, from: usize, tile: &Tile) -> Option<usize> {
        (from..4).find(|&depth| !self.reset_axis(depth, tile))
    }

    fn advance_from(&mut self, mut depth: usize, tile: &Tile) -> bool {
        loop {
            if self.increment_axis(depth, tile) {
                match self.reset_from(depth + 1, tile) {
                    None => return true,
                    Some(empty) => depth = empty - 1,
                }
            } else if depth == 0 {
                return false;
            } else {
                depth -= 1;
            }
        }
    }

    fn axis(&self, depth: usize) -> Axis {
        self.change().order.axes()[depth]
    }

    fn reset_axis(&mut self, depth: usize, tile: &Tile) -> bool {
        let b = self.bounds(tile);
        match self.axis(depth) {
            Axis::Layer => {
                self.state.layer = 0;
                b.layer_end > 0
            }
            Axis::Resolution => {
                self.state.resolution = b.res_start;
                b.res_start < b.res_end
            }
            Axis::Component => {
                self.state.component = b.comp_start;
                b.comp_start < b.comp_end
            }
            Axis::Position if self.change().order.is_spatial() => {
                let Some(step) = self.grid_steps(tile, &b) else {
                    return false;
                };
                self.state.step = step;
                self.state.position = Position {
                    x: tile.rect.x0 as u64,
                    y: tile.rect.y0 as u64,
                    index: 0,
                };
                !tile.rect.is_empty()
            }
            Axis::Position => {
                self.state.position = Position::default();
                tile.resolution(self.state.component, self.state.resolution)
                    .is_some_and(|r| r.num_precincts() > 0)
            }
        }
    }

    fn increment_axis(&mut self, depth: usize, tile: &Tile) -> bool {
        let b = self.bounds(tile);
        let s = &mut self.state;
        match self.changes[s.change_idx].order.axes()[depth] {
            Axis::Layer => {
                s.layer += 1;
                s.layer < b.layer_end
            }
            Axis::Resolution => {
                s.resolution += 1;
                s.resolution < b.res_end
            }
            Axis::Component => {
                s.component += 1;
                s.component < b.comp_end
            }
            Axis::Position if self.changes[s.change_idx].order.is_spatial() => {
                let (sx, sy) = s.step;
                let p = &mut s.position;
                p.x += sx - p.x % sx;
                if p.x >= tile.rect.x1 as u64 {
                    p.x = tile.rect.x0 as u64;
                    p.y += sy - p.y % sy;
                }
                p.y < tile.rect.y1 as u64
            }
            Axis::Position => {
                s.position.index += 1;
                tile.resolution(s.component, s.resolution)
                    .is_some_and(|r| s.position.index < r.num_precincts())
            }
        }
    }

    /// Smallest precinct step on the reference grid over the (component,
    /// resolution) pairs the position loop can reach.
    fn grid_steps(&self, tile: &Tile, b: &Bounds) -> Option<(u64, u64)> {
        let order = self.change().order;
        let depth_p = order.depth(Axis::Position);
        let comps = if order.depth(Axis::Component) < depth_p {
            self.state.component..self.state.component + 1
        } else {
            b.comp_start..b.comp_end
        };
        let fixed_res = order.depth(Axis::Resolution) < depth_p;

        let mut step: Option<(u64, u64)> = None;
        for comp in tile.components.get(comps)? {
            let res_range = if fixed_res {
                self.state.resolution..self.state.resolution + 1
            } else {
                b.res_start..b.res_end
            };
            let lo = res_range.start.min(comp.resolutions.len());
            let hi = res_range.end.min(comp.resolutions.len()).max(lo);
            for res in &comp.resolutions[lo..hi] {
                if res.num_precincts() == 0 {
                    continue;
                }
                let shift = (comp.levels - res.index) as u32;
                let (ppx, ppy) = res.precinct_exponents;
                let sx = (comp.dx as u64) << (ppx as u32 + shift);
                let sy = (comp.dy as u64) << (ppy as u32 + shift);
                step = Some(step.map_or((sx, sy), |(x, y)| (x.min(sx), y.min(sy))));
            }
        }
        step
    }

    fn current_precinct(&self, tile: &Tile) -> Option<PrecinctRef> {
        let s = &self.state;
        let comp = tile.components.get(s.component)?;
        let res = comp.resolutions.get(s.resolution)?;
        if res.num_precincts() == 0 {
            return None;
        }

        let index = if self.change().order.is_spatial() {
            let shift = (comp.levels - res.index) as u32;
            let (ppx, ppy) = res.precinct_exponents;
            let rpx = ppx as u32 + shift;
            let rpy = ppy as u32 + shift;
            let (x, y) = (s.position.x, s.position.y);
            let dx = comp.dx as u64;
            let dy = comp.dy as u64;

            let at_row = y % (dy << rpy) == 0
                || (y == tile.rect.y0 as u64 && ((res.rect.y0 as u64) << shift) % (1u64 << rpy) != 0);
            let at_col = x % (dx << rpx) == 0
                || (x == tile.rect.x0 as u64 && ((res.rect.x0 as u64) << shift) % (1u64 << rpx) != 0);
            if !at_row || !at_col {
                return None;
            }

            let col = (x.div_ceil(dx << shift) >> ppx) - ((res.rect.x0 as u64) >> ppx);
            let row = (y.div_ceil(dy << shift) >> ppy) - ((res.rect.y0 as u64) >> ppy);
            if col >= res.precinct_cols as u64 || row >= res.precinct_rows as u64 {
                return None;
            }
            row as usize * res.precinct_cols + col as usize
        } else {
            s.position.index
        };

        Some(PrecinctRef::new(tile.index, s.component, s.resolution, index))
    }
}
