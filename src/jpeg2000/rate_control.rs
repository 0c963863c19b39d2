//! Rate control context: owns the tiles and precinct state, simulates the
//! codestream size a slope threshold would produce and searches for the
//! threshold meeting a byte budget.

use super::emitter::EmitterState;
use super::image::{CodestreamParams, Tile};
use super::layers::LayerSpec;
use super::packet::SubbandBlocks;
use super::precinct::{Precinct, PrecinctRef, Selection};
use super::progression::{ProgressionChange, Sequencer};
use super::ready::PrecinctSubmitter;
use crate::constants::{
    DEFAULT_INITIAL_GRADIENT, DEFAULT_LAYER_SLOPE_SPACING, DEFAULT_RATE_TOLERANCE, MAXIMUM_RATE_TOLERANCE,
    MAXIMUM_SEARCH_ITERATIONS, MAXIMUM_SLOPE_THRESHOLD,
};
use crate::error::PcrdError;

/// Byte limits on reduced-resolution renditions of the image. Entry `d`
/// bounds the packets of every resolution that survives discarding `d`
/// levels, summed over components. Zero entries are unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionLengthLimits {
    limits: Vec<u64>,
}

impl ResolutionLengthLimits {
    pub fn new(limits: Vec<u64>) -> Self {
        Self { limits }
    }

    pub fn is_empty(&self) -> bool {
        self.limits.iter().all(|&l| l == 0)
    }

    pub fn limits(&self) -> &[u64] {
        &self.limits
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateControlConfig {
    /// Fraction of a sized layer's target the search may fall short by.
    pub tolerance: f64,
    /// Threshold separation for unconstrained layers with a sized neighbour
    /// on one side only.
    pub layer_slope_spacing: u16,
    /// Top up the final sized layer with truncation points below its
    /// threshold while budget remains.
    pub sloppy_fill: bool,
    /// Seed for the secant step, in threshold units per doubling of bytes.
    pub initial_gradient: f64,
    pub resolution_limits: ResolutionLengthLimits,
}

impl Default for RateControlConfig {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_RATE_TOLERANCE,
            layer_slope_spacing: DEFAULT_LAYER_SLOPE_SPACING,
            sloppy_fill: true,
            initial_gradient: DEFAULT_INITIAL_GRADIENT,
            resolution_limits: ResolutionLengthLimits::default(),
        }
    }
}

impl RateControlConfig {
    pub fn validate(&self) -> Result<(), PcrdError> {
        if !(0.0..=MAXIMUM_RATE_TOLERANCE).contains(&self.tolerance) {
            log::error!("rate tolerance {} outside [0, {}]", self.tolerance, MAXIMUM_RATE_TOLERANCE);
            return Err(PcrdError::InvalidRateTolerance);
        }
        if !(self.initial_gradient < 0.0) {
            return Err(PcrdError::InvalidArgument);
        }
        Ok(())
    }

    /// Lower bound the search accepts for a layer targeting `max_bytes`.
    pub fn min_bytes(&self, max_bytes: i64) -> i64 {
        (max_bytes as f64 * (1.0 - self.tolerance)).floor() as i64
    }
}

/// Result of simulating one layer at one threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Simulation {
    /// Cumulative codestream bytes through the simulated layer.
    pub bytes: i64,
    /// True when the resolution length limits would be exceeded.
    pub resolution_limit_exceeded: bool,
}

#[derive(Debug, Default)]
struct ConstraintWarnings {
    resolution_conflict: bool,
    trim_conflict: bool,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    threshold: u16,
    bytes: i64,
    fits: bool,
    limited: bool,
}

/// A precinct's packet as planned by a simulation.
struct PlannedPacket {
    precinct: PrecinctRef,
    selection: Selection,
    cost: i64,
}

pub struct RateControlContext {
    pub(crate) tiles: Vec<Tile>,
    pub(crate) sequencers: Vec<Sequencer>,
    pub(crate) num_layers: u16,
    pub(crate) config: RateControlConfig,
    pub(crate) layer_spec: LayerSpec,
    pub(crate) submitter: PrecinctSubmitter,
    /// Bytes committed to each layer, over all flushes.
    pub(crate) layer_bytes: Vec<u64>,
    pub(crate) layer_distortion: Vec<f64>,
    pub(crate) layer_thresholds: Vec<u16>,
    pub(crate) emitter: EmitterState,
    /// Committed bytes per component and resolution, over all tiles.
    resolution_bytes: Vec<Vec<i64>>,
    component_levels: Vec<u8>,
    installed_area: u64,
    total_area: u64,
    installed_precincts: usize,
    total_precincts: usize,
    gradient: Option<f64>,
    warnings: ConstraintWarnings,
}

impl RateControlContext {
    pub fn new(params: &CodestreamParams, layer_spec: LayerSpec, config: RateControlConfig) -> Result<Self, PcrdError> {
        config.validate()?;
        layer_spec.validate(params.num_layers)?;
        let tiles = params.build_tiles()?;
        let sequencers = tiles.iter().map(Sequencer::new).collect::<Result<Vec<_>, _>>()?;
        let submitter = PrecinctSubmitter::new(&tiles);
        let emitter = EmitterState::new(sequencers.iter().map(|s| s.changes().len()).collect());

        let component_levels: Vec<u8> = params.components.iter().map(|c| c.levels).collect();
        let resolution_bytes = component_levels
            .iter()
            .map(|&levels| vec![0; levels as usize + 1])
            .collect();
        let total_area = tiles.iter().map(Tile::total_area).sum();
        let total_precincts = tiles
            .iter()
            .flat_map(|t| &t.components)
            .flat_map(|c| &c.resolutions)
            .map(|r| r.num_precincts())
            .sum();
        let num_layers = params.num_layers as usize;

        log::debug!(
            "rate control: {} tiles, {} precincts, {} layers",
            tiles.len(),
            total_precincts,
            num_layers
        );

        Ok(Self {
            tiles,
            sequencers,
            num_layers: params.num_layers,
            layer_spec,
            submitter,
            layer_bytes: vec![0; num_layers],
            layer_distortion: vec![0.0; num_layers],
            layer_thresholds: vec![MAXIMUM_SLOPE_THRESHOLD; num_layers],
            emitter,
            resolution_bytes,
            component_levels,
            installed_area: 0,
            total_area,
            installed_precincts: 0,
            total_precincts,
            gradient: None,
            warnings: ConstraintWarnings::default(),
            config,
        })
    }

    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    pub fn num_layers(&self) -> u16 {
        self.num_layers
    }

    pub fn config(&self) -> &RateControlConfig {
        &self.config
    }

    /// True once a resolution limit or a trim minimum could not be honoured
    /// and a best-effort threshold was used instead.
    pub fn has_constraint_conflict(&self) -> bool {
        self.warnings.resolution_conflict || self.warnings.trim_conflict
    }

    pub fn layer_spec(&self) -> &LayerSpec {
        &self.layer_spec
    }

    /// Bytes committed to each layer so far.
    pub fn layer_bytes(&self) -> &[u64] {
        &self.layer_bytes
    }

    /// Handle for block-coding threads.
    pub fn submitter(&self) -> PrecinctSubmitter {
        self.submitter.clone()
    }

    /// Installs a precinct's code-blocks directly, bypassing the ready queues.
    pub fn submit_precinct(&mut self, precinct: PrecinctRef, subbands: Vec<SubbandBlocks>) -> Result<(), PcrdError> {
        let tile = self
            .tiles
            .get_mut(precinct.tile)
            .ok_or(PcrdError::InvalidPrecinctReference)?;
        let area = tile.install_precinct(precinct, subbands)?;
        self.installed_area += area;
        self.installed_precincts += 1;
        Ok(())
    }

    /// Moves every queued notice into its precinct. Returns the number of
    /// precincts installed. A rejected notice does not stop the others from
    /// being installed; the first rejection is returned afterwards.
    pub fn collect_ready(&mut self) -> Result<usize, PcrdError> {
        let mut count = 0;
        let mut first_error = None;
        for notice in self.submitter.drain() {
            let precinct = notice.precinct;
            match self.submit_precinct(precinct, notice.subbands) {
                Ok(()) => count += 1,
                Err(err) => {
                    log::error!("precinct {precinct:?} rejected: {err}");
                    first_error.get_or_insert(err);
                }
            }
        }
        if count > 0 {
            log::trace!("collected {count} ready precincts");
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(count),
        }
    }

    pub fn is_fully_submitted(&self) -> bool {
        self.installed_precincts == self.total_precincts
    }

    /// Fraction of the image's sample area whose code-blocks have arrived.
    pub fn ready_fraction(&self) -> f64 {
        if self.total_area == 0 {
            return 1.0;
        }
        self.installed_area as f64 / self.total_area as f64
    }

    pub fn append_progression(&mut self, tile: usize, change: ProgressionChange) -> Result<(), PcrdError> {
        let t = self.tiles.get(tile).ok_or(PcrdError::InvalidArgument)?;
        self.sequencers
            .get_mut(tile)
            .ok_or(PcrdError::InvalidArgument)?
            .append_progression(change, t)
    }

    pub(crate) fn precinct(&self, precinct: PrecinctRef) -> Option<&Precinct> {
        self.tiles
            .get(precinct.tile)?
            .resolution(precinct.component, precinct.resolution)?
            .precinct(precinct.index)
    }

    /// Precincts taking part in the current allocation round.
    pub(crate) fn eligible_precincts(&self) -> Vec<PrecinctRef> {
        let mut refs = Vec::new();
        for tile in &self.tiles {
            for comp in &tile.components {
                for res in &comp.resolutions {
                    refs.extend(
                        res.ready_precincts()
                            .map(|i| PrecinctRef::new(tile.index, comp.index, res.index as usize, i)),
                    );
                }
            }
        }
        refs
    }

    /// Cumulative codestream bytes through `layer_idx` if every eligible
    /// precinct's next layer used `threshold`.
    pub fn simulate_output(
        &mut self,
        layer_idx: u16,
        threshold: u16,
        finalize: bool,
        is_last_layer: bool,
        max_bytes: i64,
    ) -> Result<i64, PcrdError> {
        Ok(self.simulate(layer_idx, threshold, finalize, is_last_layer, max_bytes)?.bytes)
    }

    /// Simulates layer `layer_idx` at `threshold`. Precincts whose earlier
    /// layers are not yet formed are simulated as if those layers took
    /// everything and `layer_idx` were empty.
    ///
    /// With `finalize` the packets are formed and committed. The final
    /// layer may then be topped up below `threshold` within `max_bytes`.
    /// Without it the walk stops once `max_bytes` is exceeded.
    pub fn simulate(
        &mut self,
        layer_idx: u16,
        threshold: u16,
        finalize: bool,
        is_last_layer: bool,
        max_bytes: i64,
    ) -> Result<Simulation, PcrdError> {
        if layer_idx >= self.num_layers {
            return Err(PcrdError::InvalidArgument);
        }

        let base: u64 = self.layer_bytes[..=layer_idx as usize].iter().sum();
        let mut total = base as i64;
        let limited = !self.config.resolution_limits.is_empty();
        let mut res_bytes = self.resolution_bytes.clone();
        let mut plan = Vec::new();

        for precinct in self.eligible_precincts() {
            let Some(p) = self.precinct(precinct) else {
                continue;
            };
            if finalize && p.finalized_layers() != layer_idx {
                log::error!(
                    "precinct {:?} has {} layers formed, cannot finalize layer {}",
                    precinct,
                    p.finalized_layers(),
                    layer_idx
                );
                return Err(PcrdError::InvalidOperation);
            }
            let selection = p.selection(threshold);
            let cost = p.packet_cost(layer_idx, &selection) as i64;
            total += cost;
            res_bytes[precinct.component][precinct.resolution] += cost;

            if finalize {
                plan.push(PlannedPacket {
                    precinct,
                    selection,
                    cost,
                });
            } else if total > max_bytes {
                return Ok(Simulation {
                    bytes: total,
                    resolution_limit_exceeded: false,
                });
            }
        }

        if finalize && is_last_layer && self.config.sloppy_fill && max_bytes < i64::MAX && total <= max_bytes {
            self.sloppy_fill(layer_idx, &mut plan, &mut total, &mut res_bytes, max_bytes);
        }

        let exceeded = limited && self.exceeds_resolution_limits(&res_bytes);

        if finalize {
            self.commit(layer_idx, threshold, plan)?;
            if is_last_layer || layer_idx + 1 == self.num_layers {
                for tile in &mut self.tiles {
                    tile.retire_finalized();
                }
            }
        }

        Ok(Simulation {
            bytes: total,
            resolution_limit_exceeded: exceeded,
        })
    }

    fn commit(&mut self, layer_idx: u16, threshold: u16, plan: Vec<PlannedPacket>) -> Result<(), PcrdError> {
        let layer = layer_idx as usize;
        for planned in plan {
            let r = planned.precinct;
            let precinct = self.tiles[r.tile]
                .precinct_mut(r)
                .ok_or(PcrdError::InvalidPrecinctReference)?;
            let gain = precinct.distortion_gain(&planned.selection);
            let bytes = precinct.finalize_layer(&planned.selection)?.len() as u64;
            debug_assert_eq!(bytes as i64, planned.cost);
            self.layer_bytes[layer] += bytes;
            self.layer_distortion[layer] += gain;
            self.resolution_bytes[r.component][r.resolution] += bytes as i64;
        }
        self.layer_thresholds[layer] = threshold;
        log::debug!(
            "layer {} finalized at threshold {}: {} bytes",
            layer_idx,
            threshold,
            self.layer_bytes[layer]
        );
        Ok(())
    }

    /// Adds truncation points just below the threshold, steepest first,
    /// while they fit in the remaining budget.
    fn sloppy_fill(
        &self,
        layer_idx: u16,
        plan: &mut [PlannedPacket],
        total: &mut i64,
        res_bytes: &mut [Vec<i64>],
        max_bytes: i64,
    ) {
        let limited = !self.config.resolution_limits.is_empty();
        let mut candidates = Vec::new();
        for (i, planned) in plan.iter().enumerate() {
            if let Some(p) = self.precinct(planned.precinct) {
                candidates.extend(p.fill_candidates(&planned.selection).into_iter().map(|c| (i, c)));
            }
        }
        candidates.sort_by(|a, b| b.1.slope.cmp(&a.1.slope));

        let mut added = 0usize;
        for (i, candidate) in candidates {
            if *total >= max_bytes {
                break;
            }
            let planned = &mut plan[i];
            let Some(p) = self.precinct(planned.precinct) else {
                continue;
            };
            let mut trial = planned.selection.clone();
            trial[candidate.subband][candidate.block] += 1;
            let cost = p.packet_cost(layer_idx, &trial) as i64;
            let delta = cost - planned.cost;
            if *total + delta > max_bytes {
                continue;
            }
            let r = planned.precinct;
            res_bytes[r.component][r.resolution] += delta;
            if limited && self.exceeds_resolution_limits(res_bytes) {
                res_bytes[r.component][r.resolution] -= delta;
                continue;
            }
            planned.selection = trial;
            planned.cost = cost;
            *total += delta;
            added += 1;
        }
        if added > 0 {
            log::debug!("sloppy fill added {added} truncation points to layer {layer_idx}");
        }
    }

    fn exceeds_resolution_limits(&self, res_bytes: &[Vec<i64>]) -> bool {
        let fraction = self.ready_fraction();
        for (discard, &limit) in self.config.resolution_limits.limits().iter().enumerate() {
            if limit == 0 {
                continue;
            }
            let scaled = (limit as f64 * fraction).floor() as i64;
            let bytes: i64 = res_bytes
                .iter()
                .zip(&self.component_levels)
                .map(|(bytes, &levels)| {
                    let top = (levels as usize).saturating_sub(discard);
                    bytes[..=top].iter().sum::<i64>()
                })
                .sum();
            if bytes > scaled {
                return true;
            }
        }
        false
    }

    fn probe(&mut self, layer_idx: u16, threshold: u16, max_bytes: i64) -> Result<Sample, PcrdError> {
        let sim = self.simulate(layer_idx, threshold, false, false, max_bytes)?;
        Ok(Sample {
            threshold,
            bytes: sim.bytes,
            fits: sim.bytes <= max_bytes && !sim.resolution_limit_exceeded,
            limited: sim.resolution_limit_exceeded,
        })
    }

    /// Finds the smallest threshold no greater than `upper` whose cumulative
    /// output through `layer_idx` stays within `max_bytes` and the resolution
    /// limits. The search may stop early once the output reaches
    /// `min_bytes`. When even `upper` overshoots, `upper` is returned.
    pub fn find_slope_threshold(
        &mut self,
        layer_idx: u16,
        min_bytes: i64,
        max_bytes: i64,
        upper: u16,
    ) -> Result<u16, PcrdError> {
        let min_bytes = min_bytes.min(max_bytes);

        let top = self.probe(layer_idx, upper, max_bytes)?;
        if !top.fits {
            if top.limited {
                self.warn_resolution_conflict(layer_idx);
            }
            log::debug!("layer {layer_idx}: {} bytes at upper bound {upper}", top.bytes);
            return Ok(upper);
        }
        if top.bytes >= min_bytes || upper == 0 {
            return Ok(upper);
        }
        let bottom = self.probe(layer_idx, 0, max_bytes)?;
        if bottom.fits {
            return Ok(0);
        }

        let target = if min_bytes < max_bytes {
            min_bytes + (max_bytes - min_bytes) / 2
        } else {
            max_bytes
        };

        // `fit` stays within budget, `over` does not; fit.threshold > over.threshold.
        let mut fit = top;
        let mut over = bottom;
        let mut interior = false;
        let mut bisect_next = false;
        let mut iterations = 0;

        while fit.threshold - over.threshold > 1 && fit.bytes < min_bytes && iterations < MAXIMUM_SEARCH_ITERATIONS {
            iterations += 1;
            let span = fit.threshold - over.threshold;
            let candidate = if bisect_next {
                None
            } else {
                self.secant_estimate(&fit, &over, target, interior)
            }
            .unwrap_or(over.threshold + span / 2)
            .clamp(over.threshold + 1, fit.threshold - 1);

            let sample = self.probe(layer_idx, candidate, max_bytes)?;
            if sample.fits {
                fit = sample;
            } else {
                over = sample;
            }
            interior = true;
            bisect_next = (fit.threshold - over.threshold) as u32 * 2 > span as u32;
        }

        if over.bytes > fit.bytes && fit.bytes > 0 && !over.limited {
            let gradient = (over.threshold as f64 - fit.threshold as f64)
                / ((over.bytes as f64).log2() - (fit.bytes as f64).log2());
            if gradient.is_finite() && gradient < 0.0 {
                self.gradient = Some(gradient);
            }
        }

        if fit.bytes < min_bytes && over.limited && over.bytes <= max_bytes {
            self.warn_resolution_conflict(layer_idx);
        }
        log::trace!(
            "layer {layer_idx}: threshold {} gives {} bytes (window {min_bytes}..={max_bytes}, {iterations} steps)",
            fit.threshold,
            fit.bytes
        );
        Ok(fit.threshold)
    }

    /// Threshold at which log-bytes are expected to reach `target`, from the
    /// bracketing samples or from the gradient learned on earlier layers.
    fn secant_estimate(&self, fit: &Sample, over: &Sample, target: i64, interior: bool) -> Option<u16> {
        let log_target = (target.max(1) as f64).log2();
        let log_fit = (fit.bytes.max(1) as f64).log2();

        let gradient = if interior && over.bytes > target && !over.limited {
            (over.threshold as f64 - fit.threshold as f64) / ((over.bytes as f64).log2() - log_fit)
        } else if !interior && fit.threshold < MAXIMUM_SLOPE_THRESHOLD {
            self.gradient.unwrap_or(self.config.initial_gradient)
        } else {
            return None;
        };
        let estimate = fit.threshold as f64 + gradient * (log_target - log_fit);
        estimate
            .is_finite()
            .then(|| estimate.round().clamp(0.0, MAXIMUM_SLOPE_THRESHOLD as f64) as u16)
    }

    pub(crate) fn warn_resolution_conflict(&mut self, layer_idx: u16) {
        if !self.warnings.resolution_conflict {
            self.warnings.resolution_conflict = true;
            log::warn!(
                "layer {layer_idx}: resolution length limits prevent reaching the requested layer size; \
                 layer sizes may fall short of their targets"
            );
        }
    }

    pub(crate) fn warn_trim_conflict(&mut self, layer_idx: u16) {
        if !self.warnings.trim_conflict {
            self.warnings.trim_conflict = true;
            log::warn!(
                "layer {layer_idx}: minimum layer size cannot be met above the next layer's threshold; \
                 using the best available threshold"
            );
        }
    }
}
