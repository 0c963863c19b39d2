//! Codestream geometry: tiles, tile-components, resolutions and precinct grids.

use std::collections::BTreeSet;

use super::packet::SubbandBlocks;
use super::precinct::{Precinct, PrecinctRef, PrecinctStatus};
use super::progression::{ProgressionChange, ProgressionOrder};
use crate::constants::{MAXIMUM_DECOMPOSITION_LEVELS, MAXIMUM_PRECINCT_EXPONENT};
use crate::error::PcrdError;

/// Orientation of a wavelet subband.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubbandOrientation {
    #[default]
    /// Low-Low (base image)
    LL,
    /// High-Low (horizontal details)
    HL,
    /// Low-High (vertical details)
    LH,
    /// High-High (diagonal details)
    HH,
}

impl SubbandOrientation {
    /// Subbands a resolution level contributes, in packet order.
    pub fn for_resolution(resolution: usize) -> &'static [SubbandOrientation] {
        if resolution == 0 {
            &[SubbandOrientation::LL]
        } else {
            &[SubbandOrientation::HL, SubbandOrientation::LH, SubbandOrientation::HH]
        }
    }
}

/// A half-open rectangle `[x0, x1) x [y0, y1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl Rect {
    pub fn new(x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> u32 {
        self.x1.saturating_sub(self.x0)
    }

    pub fn height(&self) -> u32 {
        self.y1.saturating_sub(self.y0)
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn intersect(&self, other: &Rect) -> Rect {
        Rect {
            x0: self.x0.max(other.x0),
            y0: self.y0.max(other.y0),
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
        }
    }

    /// Maps the rectangle through `ceil(v / d)` on both axes.
    pub fn scaled_down(&self, dx: u32, dy: u32) -> Rect {
        Rect {
            x0: self.x0.div_ceil(dx),
            y0: self.y0.div_ceil(dy),
            x1: self.x1.div_ceil(dx),
            y1: self.y1.div_ceil(dy),
        }
    }
}

/// Per-component coding parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentParams {
    /// Horizontal subsampling factor
    pub dx: u32,
    /// Vertical subsampling factor
    pub dy: u32,
    /// Number of wavelet decomposition levels.
    pub levels: u8,
    /// Precinct size exponents `(PPx, PPy)`. The first entry applies to the
    /// highest resolution, the next to the one below it; the last entry
    /// repeats. Empty means maximal precincts.
    pub precinct_exponents: Vec<(u8, u8)>,
}

impl ComponentParams {
    pub fn new(dx: u32, dy: u32, levels: u8) -> Self {
        Self {
            dx,
            dy,
            levels,
            precinct_exponents: Vec::new(),
        }
    }

    pub fn with_precincts(mut self, exponents: Vec<(u8, u8)>) -> Self {
        self.precinct_exponents = exponents;
        self
    }

    pub fn precinct_exponent(&self, resolution: u8) -> (u8, u8) {
        let idx = (self.levels - resolution) as usize;
        self.precinct_exponents
            .get(idx)
            .or(self.precinct_exponents.last())
            .copied()
            .unwrap_or((MAXIMUM_PRECINCT_EXPONENT, MAXIMUM_PRECINCT_EXPONENT))
    }
}

/// Geometry and sequencing parameters of a codestream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodestreamParams {
    /// Image area on the reference grid.
    pub image: Rect,
    pub tile_origin: (u32, u32),
    /// Nominal tile size; `(0, 0)` means a single tile covering the image.
    pub tile_size: (u32, u32),
    pub components: Vec<ComponentParams>,
    pub num_layers: u16,
    pub order: ProgressionOrder,
    /// Progression order changes applied to every tile.
    pub progression_changes: Vec<ProgressionChange>,
}

impl CodestreamParams {
    pub fn single_tile(
        width: u32,
        height: u32,
        components: Vec<ComponentParams>,
        num_layers: u16,
        order: ProgressionOrder,
    ) -> Self {
        Self {
            image: Rect::new(0, 0, width, height),
            tile_origin: (0, 0),
            tile_size: (0, 0),
            components,
            num_layers,
            order,
            progression_changes: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), PcrdError> {
        if self.image.is_empty() || self.components.is_empty() {
            return Err(PcrdError::InvalidGeometry);
        }
        if self.num_layers == 0 {
            return Err(PcrdError::LayerCountMismatch);
        }
        if self.tile_origin.0 > self.image.x0 || self.tile_origin.1 > self.image.y0 {
            return Err(PcrdError::InvalidGeometry);
        }
        if (self.tile_size.0 == 0) != (self.tile_size.1 == 0) {
            return Err(PcrdError::InvalidGeometry);
        }
        for comp in &self.components {
            if comp.dx == 0 || comp.dy == 0 || comp.levels > MAXIMUM_DECOMPOSITION_LEVELS {
                return Err(PcrdError::InvalidGeometry);
            }
            if comp
                .precinct_exponents
                .iter()
                .any(|&(x, y)| x > MAXIMUM_PRECINCT_EXPONENT || y > MAXIMUM_PRECINCT_EXPONENT)
            {
                return Err(PcrdError::InvalidGeometry);
            }
        }
        for change in &self.progression_changes {
            change.validate()?;
        }
        Ok(())
    }

    /// Tile rectangles on the reference grid, in raster order.
    pub fn tile_rects(&self) -> Vec<Rect> {
        if self.tile_size == (0, 0) {
            return vec![self.image];
        }
        let (ox, oy) = self.tile_origin;
        let (tw, th) = self.tile_size;
        let cols = (self.image.x1 - ox).div_ceil(tw) - (self.image.x0 - ox) / tw;
        let rows = (self.image.y1 - oy).div_ceil(th) - (self.image.y0 - oy) / th;
        let first_col = (self.image.x0 - ox) / tw;
        let first_row = (self.image.y0 - oy) / th;

        let mut rects = Vec::with_capacity((cols * rows) as usize);
        for row in first_row..first_row + rows {
            for col in first_col..first_col + cols {
                let x0 = ox as u64 + col as u64 * tw as u64;
                let y0 = oy as u64 + row as u64 * th as u64;
                let tile = Rect::new(
                    x0.min(u32::MAX as u64) as u32,
                    y0.min(u32::MAX as u64) as u32,
                    (x0 + tw as u64).min(u32::MAX as u64) as u32,
                    (y0 + th as u64).min(u32::MAX as u64) as u32,
                );
                rects.push(tile.intersect(&self.image));
            }
        }
        rects
    }

    pub fn build_tiles(&self) -> Result<Vec<Tile>, PcrdError> {
        self.validate()?;
        Ok(self
            .tile_rects()
            .into_iter()
            .enumerate()
            .map(|(index, rect)| Tile::new(index, rect, self))
            .collect())
    }
}

/// A resolution level of a tile-component and its precinct grid.
#[derive(Debug)]
pub struct Resolution {
    pub index: u8,
    /// Bounds in resolution-level coordinates.
    pub rect: Rect,
    pub precinct_exponents: (u8, u8),
    pub precinct_cols: usize,
    pub precinct_rows: usize,
    precinct_origin: (u64, u64),
    /// Decomposition levels between this resolution and the full component.
    level_shift: u8,
    dy: u32,
    /// Created on first delivery. A released precinct keeps only its layer
    /// counters, so the progression still sees it as sequenced.
    precincts: Vec<Option<Precinct>>,
    ready: BTreeSet<usize>,
    installed: usize,
}

impl Resolution {
    fn new(index: u8, comp_rect: Rect, comp: &ComponentParams) -> Self {
        let level_shift = comp.levels - index;
        let scale = 1u32.checked_shl(level_shift as u32).unwrap_or(0);
        let rect = if scale == 0 {
            Rect::new(
                u32::from(comp_rect.x0 > 0),
                u32::from(comp_rect.y0 > 0),
                u32::from(comp_rect.x1 > 0),
                u32::from(comp_rect.y1 > 0),
            )
        } else {
            comp_rect.scaled_down(scale, scale)
        };
        let (ppx, ppy) = comp.precinct_exponent(index);
        let (cols, rows, origin) = if rect.is_empty() {
            (0, 0, (0, 0))
        } else {
            let px0 = rect.x0 as u64 >> ppx;
            let py0 = rect.y0 as u64 >> ppy;
            let px1 = (rect.x1 as u64).div_ceil(1 << ppx);
            let py1 = (rect.y1 as u64).div_ceil(1 << ppy);
            ((px1 - px0) as usize, (py1 - py0) as usize, (px0, py0))
        };

        let mut precincts = Vec::new();
        precincts.resize_with(cols * rows, || None);

        Self {
            index,
            rect,
            precinct_exponents: (ppx, ppy),
            precinct_cols: cols,
            precinct_rows: rows,
            precinct_origin: origin,
            level_shift,
            dy: comp.dy,
            precincts,
            ready: BTreeSet::new(),
            installed: 0,
        }
    }

    pub fn num_precincts(&self) -> usize {
        self.precinct_cols * self.precinct_rows
    }

    pub fn subband_count(&self) -> usize {
        SubbandOrientation::for_resolution(self.index as usize).len()
    }

    pub fn precinct(&self, index: usize) -> Option<&Precinct> {
        self.precincts.get(index)?.as_ref()
    }

    pub fn precinct_mut(&mut self, index: usize) -> Option<&mut Precinct> {
        self.precincts.get_mut(index)?.as_mut()
    }

    /// Next layer the progression must visit for a precinct; 0 for precincts
    /// whose code-blocks have not arrived.
    pub fn next_layer_idx(&self, index: usize) -> u16 {
        self.precinct(index).map_or(0, Precinct::next_layer_idx)
    }

    /// Bounds of a precinct in resolution-level coordinates.
    pub fn precinct_rect(&self, index: usize) -> Rect {
        let (ppx, ppy) = self.precinct_exponents;
        let col = (index % self.precinct_cols.max(1)) as u64 + self.precinct_origin.0;
        let row = (index / self.precinct_cols.max(1)) as u64 + self.precinct_origin.1;
        let clamp = |v: u64| v.min(u32::MAX as u64) as u32;
        Rect::new(
            clamp(col << ppx),
            clamp(row << ppy),
            clamp((col + 1) << ppx),
            clamp((row + 1) << ppy),
        )
        .intersect(&self.rect)
    }

    pub fn precinct_area(&self, index: usize) -> u64 {
        self.precinct_rect(index).area()
    }

    fn install(&mut self, index: usize, subbands: Vec<SubbandBlocks>, num_layers: u16) -> Result<u64, PcrdError> {
        let expected = self.subband_count();
        let slot = self
            .precincts
            .get_mut(index)
            .ok_or(PcrdError::InvalidPrecinctReference)?;
        let precinct = slot.get_or_insert_with(|| Precinct::new(num_layers));
        precinct.install(subbands, expected)?;
        self.ready.insert(index);
        self.installed += 1;
        Ok(self.precinct_area(index))
    }

    /// Precincts whose code-blocks arrived and whose layers are not all formed.
    pub fn ready_precincts(&self) -> impl Iterator<Item = usize> + '_ {
        self.ready.iter().copied()
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    pub(crate) fn retire_finalized(&mut self) {
        let precincts = &self.precincts;
        self.ready
            .retain(|&i| !precincts[i].as_ref().is_some_and(Precinct::is_fully_finalized));
    }

    /// Precincts whose code-blocks are still outstanding.
    pub fn pending_count(&self) -> usize {
        self.num_precincts() - self.installed
    }

    fn is_installed(&self, index: usize) -> bool {
        self.precinct(index)
            .is_some_and(|p| p.status() != PrecinctStatus::Pending)
    }

    /// Bottom edge of a precinct row, on the reference grid.
    fn row_bottom_on_grid(&self, row: usize) -> u64 {
        let y1 = (((row as u64 + self.precinct_origin.1 + 1) << self.precinct_exponents.1) as u64)
            .min(self.rect.y1 as u64);
        (y1 << self.level_shift) * self.dy as u64
    }

    /// Bottom, on the reference grid, of the first precinct row with
    /// outstanding code-blocks.
    pub fn first_pending_row_bottom(&self) -> Option<u64> {
        (0..self.precinct_rows)
            .find(|&row| (0..self.precinct_cols).any(|col| !self.is_installed(row * self.precinct_cols + col)))
            .map(|row| self.row_bottom_on_grid(row))
    }

    /// Extent, on the reference grid, of the leading precinct rows whose
    /// code-blocks have all arrived.
    pub fn ready_extent(&self) -> u64 {
        let mut extent = ((self.rect.y0 as u64) << self.level_shift) * self.dy as u64;
        for row in 0..self.precinct_rows {
            if (0..self.precinct_cols).any(|col| !self.is_installed(row * self.precinct_cols + col)) {
                break;
            }
            extent = self.row_bottom_on_grid(row);
        }
        extent
    }
}

#[derive(Debug)]
pub struct TileComponent {
    pub index: usize,
    pub dx: u32,
    pub dy: u32,
    pub levels: u8,
    /// Bounds in component coordinates.
    pub rect: Rect,
    pub resolutions: Vec<Resolution>,
}

impl TileComponent {
    fn new(index: usize, tile_rect: Rect, params: &ComponentParams) -> Self {
        let rect = tile_rect.scaled_down(params.dx, params.dy);
        let resolutions = (0..=params.levels)
            .map(|r| Resolution::new(r, rect, params))
            .collect();
        Self {
            index,
            dx: params.dx,
            dy: params.dy,
            levels: params.levels,
            rect,
            resolutions,
        }
    }
}

#[derive(Debug)]
pub struct Tile {
    pub index: usize,
    /// Bounds on the reference grid.
    pub rect: Rect,
    pub components: Vec<TileComponent>,
    pub num_layers: u16,
    pub order: ProgressionOrder,
    pub progression_changes: Vec<ProgressionChange>,
    relevant_packets: u64,
    sequenced_packets: u64,
    total_area: u64,
}

impl Tile {
    fn new(index: usize, rect: Rect, params: &CodestreamParams) -> Self {
        let components: Vec<TileComponent> = params
            .components
            .iter()
            .enumerate()
            .map(|(c, comp)| TileComponent::new(c, rect, comp))
            .collect();
        let precincts: u64 = components
            .iter()
            .flat_map(|c| &c.resolutions)
            .map(|r| r.num_precincts() as u64)
            .sum();
        let total_area = components
            .iter()
            .flat_map(|c| &c.resolutions)
            .map(|r| r.rect.area())
            .sum();

        Self {
            index,
            rect,
            components,
            num_layers: params.num_layers,
            order: params.order,
            progression_changes: params.progression_changes.clone(),
            relevant_packets: precincts * params.num_layers as u64,
            sequenced_packets: 0,
            total_area,
        }
    }

    pub fn resolution(&self, component: usize, resolution: usize) -> Option<&Resolution> {
        self.components.get(component)?.resolutions.get(resolution)
    }

    pub fn resolution_mut(&mut self, component: usize, resolution: usize) -> Option<&mut Resolution> {
        self.components.get_mut(component)?.resolutions.get_mut(resolution)
    }

    pub fn precinct_mut(&mut self, precinct: PrecinctRef) -> Option<&mut Precinct> {
        self.resolution_mut(precinct.component, precinct.resolution)?
            .precinct_mut(precinct.index)
    }

    /// Installs the code-blocks of a precinct and returns its area.
    pub fn install_precinct(&mut self, precinct: PrecinctRef, subbands: Vec<SubbandBlocks>) -> Result<u64, PcrdError> {
        let num_layers = self.num_layers;
        self.resolution_mut(precinct.component, precinct.resolution)
            .ok_or(PcrdError::InvalidPrecinctReference)?
            .install(precinct.index, subbands, num_layers)
    }

    /// Packets (precincts times layers) the progression must cover.
    pub fn relevant_packets(&self) -> u64 {
        self.relevant_packets
    }

    pub fn sequenced_packets(&self) -> u64 {
        self.sequenced_packets
    }

    pub fn is_complete(&self) -> bool {
        self.sequenced_packets == self.relevant_packets
    }

    /// Sample area of all resolutions of all components.
    pub fn total_area(&self) -> u64 {
        self.total_area
    }

    pub fn take_packet(&mut self, precinct: PrecinctRef, layer: u16) -> Result<super::packet::PacketRecord, PcrdError> {
        let packet = self
            .precinct_mut(precinct)
            .ok_or(PcrdError::InvalidPrecinctReference)?
            .take_packet(layer)?;
        self.sequenced_packets += 1;
        Ok(packet)
    }

    pub(crate) fn retire_finalized(&mut self) {
        for comp in &mut self.components {
            for res in &mut comp.resolutions {
                res.retire_finalized();
            }
        }
    }
}
