//! Quality layer allocation: assigns a slope threshold to every layer and
//! forms the layer's packets.

use super::rate_control::RateControlContext;
use crate::constants::{MAXIMUM_SLOPE_THRESHOLD, MINIMUM_SLOPE_THRESHOLD};
use crate::error::PcrdError;

/// How quality layers are specified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerSpec {
    /// One slope threshold per layer, non-increasing.
    Slopes(Vec<u16>),
    /// Cumulative byte target per layer. Zero entries are unconstrained and
    /// receive thresholds between their sized neighbours.
    Sizes(Vec<u64>),
    /// Slope thresholds, lowered where needed so each layer reaches its
    /// minimum cumulative size (zero for none).
    Trim { slopes: Vec<u16>, min_sizes: Vec<u64> },
}

impl LayerSpec {
    pub fn validate(&self, num_layers: u16) -> Result<(), PcrdError> {
        let n = num_layers as usize;
        match self {
            LayerSpec::Slopes(slopes) => {
                check_len(slopes.len(), n)?;
                check_non_increasing(slopes)
            }
            LayerSpec::Sizes(targets) => {
                check_len(targets.len(), n)?;
                check_increasing_sizes(targets)
            }
            LayerSpec::Trim { slopes, min_sizes } => {
                check_len(slopes.len(), n)?;
                check_len(min_sizes.len(), n)?;
                check_non_increasing(slopes)?;
                check_increasing_sizes(min_sizes)
            }
        }
    }
}

fn check_len(len: usize, num_layers: usize) -> Result<(), PcrdError> {
    if len != num_layers {
        log::error!("{len} layer entries for {num_layers} quality layers");
        return Err(PcrdError::LayerCountMismatch);
    }
    Ok(())
}

fn check_non_increasing(slopes: &[u16]) -> Result<(), PcrdError> {
    if slopes.windows(2).any(|w| w[1] > w[0]) {
        return Err(PcrdError::NonMonotonicSlopeThresholds);
    }
    Ok(())
}

fn check_increasing_sizes(sizes: &[u64]) -> Result<(), PcrdError> {
    let non_zero: Vec<u64> = sizes.iter().copied().filter(|&s| s > 0).collect();
    if non_zero.windows(2).any(|w| w[1] <= w[0]) {
        return Err(PcrdError::NonIncreasingLayerTargets);
    }
    Ok(())
}

/// Byte targets for a `max[,min]` bit-rate specification over `pixels`
/// samples: the last layer gets the maximum, the first the minimum when
/// given, and the rest are left unconstrained.
pub fn layer_targets_from_rates(
    num_layers: u16,
    pixels: u64,
    max_rate: f64,
    min_rate: Option<f64>,
) -> Result<Vec<u64>, PcrdError> {
    if num_layers == 0 {
        return Err(PcrdError::LayerCountMismatch);
    }
    if !max_rate.is_finite() || max_rate <= 0.0 {
        return Err(PcrdError::InvalidRate);
    }
    let bytes = |rate: f64| (pixels as f64 * rate / 8.0).floor() as u64;

    let mut targets = vec![0; num_layers as usize];
    if let Some(min_rate) = min_rate {
        if num_layers < 2 {
            log::error!("a minimum bit-rate needs at least two quality layers");
            return Err(PcrdError::LayerCountMismatch);
        }
        if !min_rate.is_finite() || min_rate <= 0.0 || min_rate >= max_rate {
            return Err(PcrdError::InvalidRate);
        }
        targets[0] = bytes(min_rate);
    }
    let last = targets.len() - 1;
    targets[last] = bytes(max_rate);
    Ok(targets)
}

/// Outcome of allocating one layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerResult {
    pub layer: u16,
    pub threshold: u16,
    /// Cumulative byte target, for sized layers.
    pub target_bytes: Option<u64>,
    /// Cumulative packet bytes through this layer, over all flushes.
    pub cumulative_bytes: u64,
    /// Distortion reduction committed to this layer, over all flushes.
    pub distortion_reduction: f64,
}

impl RateControlContext {
    /// Forms every layer of the precincts that are ready and not yet
    /// allocated. Byte targets are scaled to the fraction of the image
    /// whose code-blocks have arrived.
    pub fn allocate_layers(&mut self) -> Result<Vec<LayerResult>, PcrdError> {
        if self.eligible_precincts().is_empty() {
            return Ok(Vec::new());
        }
        let fraction = self.ready_fraction();
        let allocation = match self.layer_spec.clone() {
            LayerSpec::Slopes(slopes) => self.allocate_by_slopes(&slopes)?,
            LayerSpec::Sizes(targets) => self.allocate_by_sizes(&scale_targets(&targets, fraction))?,
            LayerSpec::Trim { slopes, min_sizes } => {
                self.allocate_trimmed(&slopes, &scale_targets(&min_sizes, fraction))?
            }
        };

        let mut cumulative = 0;
        let results = allocation
            .into_iter()
            .enumerate()
            .map(|(l, (threshold, target_bytes))| {
                cumulative += self.layer_bytes[l];
                LayerResult {
                    layer: l as u16,
                    threshold,
                    target_bytes,
                    cumulative_bytes: cumulative,
                    distortion_reduction: self.layer_distortion[l],
                }
            })
            .collect();
        Ok(results)
    }

    fn finalize(&mut self, layer: usize, threshold: u16, max_bytes: i64) -> Result<i64, PcrdError> {
        let is_last = layer + 1 == self.num_layers as usize;
        self.simulate_output(layer as u16, threshold, true, is_last, max_bytes)
    }

    fn allocate_by_slopes(&mut self, slopes: &[u16]) -> Result<Vec<(u16, Option<u64>)>, PcrdError> {
        let mut out = Vec::with_capacity(slopes.len());
        for (l, &t) in slopes.iter().enumerate() {
            self.finalize(l, t, i64::MAX)?;
            out.push((t, None));
        }
        Ok(out)
    }

    fn allocate_by_sizes(&mut self, targets: &[u64]) -> Result<Vec<(u16, Option<u64>)>, PcrdError> {
        let n = self.num_layers as usize;
        let spacing = self.config.layer_slope_spacing;
        let mut out = Vec::with_capacity(n);
        let mut upper = MAXIMUM_SLOPE_THRESHOLD;
        let mut previous_sized: Option<(usize, u16)> = None;

        let mut l = 0;
        while l < n {
            if targets[l] > 0 {
                let max = targets[l] as i64;
                let min = self.config.min_bytes(max);
                let t = self.find_slope_threshold(l as u16, min, max, upper)?;
                let bytes = self.finalize(l, t, max)?;
                if bytes < min {
                    log::info!("layer {l}: {bytes} bytes against a target of {max}; not enough coded data");
                }
                out.push((t, Some(targets[l])));
                upper = t;
                previous_sized = Some((l, t));
                l += 1;
                continue;
            }

            let end = (l..n).find(|&i| targets[i] > 0).unwrap_or(n);
            let thresholds: Vec<u16> = if end < n {
                // Estimate where the next sized layer will land, treating
                // the unconstrained layers before it as empty.
                let max = targets[end] as i64;
                let next = self.find_slope_threshold(end as u16, self.config.min_bytes(max), max, upper)?;
                interpolate_thresholds(previous_sized, (end, next), l, spacing)
            } else {
                (l..n)
                    .map(|i| {
                        if i + 1 == n {
                            MINIMUM_SLOPE_THRESHOLD
                        } else {
                            upper.saturating_sub(spacing.saturating_mul((i - l + 1) as u16))
                        }
                    })
                    .collect()
            };

            for (i, t) in (l..end).zip(thresholds) {
                let t = self.respect_resolution_limits(i, t.min(upper), upper)?;
                self.finalize(i, t, i64::MAX)?;
                out.push((t, None));
                upper = t;
            }
            l = end;
        }
        Ok(out)
    }

    fn allocate_trimmed(&mut self, slopes: &[u16], min_sizes: &[u64]) -> Result<Vec<(u16, Option<u64>)>, PcrdError> {
        let n = self.num_layers as usize;
        let mut out = Vec::with_capacity(n);
        let mut upper = MAXIMUM_SLOPE_THRESHOLD;

        for l in 0..n {
            let ceiling = slopes[l].min(upper);
            let min = min_sizes[l] as i64;
            let mut t = ceiling;

            if min > 0 && self.bytes_at(l, ceiling)? < min {
                let floor = if l + 1 < n { slopes[l + 1].min(ceiling) } else { 0 };
                if self.bytes_at(l, floor)? < min {
                    if self.bytes_at(l, 0)? < min {
                        log::error!("layer {l}: all coded data is smaller than the minimum size {min}");
                        return Err(PcrdError::InsufficientData);
                    }
                    self.warn_trim_conflict(l as u16);
                    t = floor;
                } else {
                    // bytes(lo) >= min > bytes(hi)
                    let (mut lo, mut hi) = (floor, ceiling);
                    while hi - lo > 1 {
                        let mid = lo + (hi - lo) / 2;
                        if self.bytes_at(l, mid)? >= min {
                            lo = mid;
                        } else {
                            hi = mid;
                        }
                    }
                    t = lo;
                }
                t = self.respect_resolution_limits(l, t, ceiling)?;
            }

            self.finalize(l, t, i64::MAX)?;
            out.push((t, (min > 0).then_some(min as u64)));
            upper = t;
        }
        Ok(out)
    }

    fn bytes_at(&mut self, layer: usize, threshold: u16) -> Result<i64, PcrdError> {
        self.simulate_output(layer as u16, threshold, false, false, i64::MAX)
    }

    /// Raises a threshold to the smallest one in `[t, ceiling]` that keeps
    /// within the resolution limits.
    fn respect_resolution_limits(&mut self, layer: usize, t: u16, ceiling: u16) -> Result<u16, PcrdError> {
        if self.config.resolution_limits.is_empty() {
            return Ok(t);
        }
        let exceeded = |ctx: &mut Self, t: u16| -> Result<bool, PcrdError> {
            Ok(ctx
                .simulate(layer as u16, t, false, false, i64::MAX)?
                .resolution_limit_exceeded)
        };
        if !exceeded(self, t)? {
            return Ok(t);
        }
        self.warn_resolution_conflict(layer as u16);
        if exceeded(self, ceiling)? {
            return Ok(ceiling);
        }
        let (mut lo, mut hi) = (t, ceiling);
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            if exceeded(self, mid)? {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        Ok(hi)
    }
}

fn scale_targets(targets: &[u64], fraction: f64) -> Vec<u64> {
    if fraction >= 1.0 {
        return targets.to_vec();
    }
    targets
        .iter()
        .map(|&t| {
            if t == 0 {
                0
            } else {
                ((t as f64 * fraction).round() as u64).max(1)
            }
        })
        .collect()
}

/// Thresholds for unconstrained layers `start..next.0`. Between two sized
/// layers they are spaced evenly; before the first sized layer they step up
/// by `spacing` from its threshold.
fn interpolate_thresholds(
    previous: Option<(usize, u16)>,
    next: (usize, u16),
    start: usize,
    spacing: u16,
) -> Vec<u16> {
    let (s, ts) = next;
    match previous {
        Some((p, tp)) => (start..s)
            .map(|i| {
                let frac = (i - p) as f64 / (s - p) as f64;
                (tp as f64 - (tp as f64 - ts as f64) * frac).round() as u16
            })
            .collect(),
        None => (start..s)
            .map(|i| {
                let above = spacing as u64 * (s - i) as u64;
                (ts as u64 + above).min(MAXIMUM_SLOPE_THRESHOLD as u64) as u16
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_layer_counts() {
        assert_eq!(LayerSpec::Sizes(vec![100, 200]).validate(3), Err(PcrdError::LayerCountMismatch));
        assert_eq!(LayerSpec::Slopes(vec![]).validate(1), Err(PcrdError::LayerCountMismatch));
        assert!(LayerSpec::Sizes(vec![100, 0, 200]).validate(3).is_ok());
    }

    #[test]
    fn test_validate_monotonicity() {
        assert_eq!(
            LayerSpec::Sizes(vec![300, 0, 200]).validate(3),
            Err(PcrdError::NonIncreasingLayerTargets)
        );
        assert_eq!(
            LayerSpec::Sizes(vec![300, 300]).validate(2),
            Err(PcrdError::NonIncreasingLayerTargets)
        );
        assert_eq!(
            LayerSpec::Slopes(vec![40000, 45000]).validate(2),
            Err(PcrdError::NonMonotonicSlopeThresholds)
        );
        assert!(LayerSpec::Slopes(vec![45000, 45000, 0]).validate(3).is_ok());
        let trim = LayerSpec::Trim {
            slopes: vec![50000, 40000],
            min_sizes: vec![0, 1000],
        };
        assert!(trim.validate(2).is_ok());
    }

    #[test]
    fn test_targets_from_rates() {
        let pixels = 512 * 512;
        assert_eq!(layer_targets_from_rates(1, pixels, 1.0, None).unwrap(), vec![32768]);
        assert_eq!(
            layer_targets_from_rates(3, pixels, 2.0, Some(0.5)).unwrap(),
            vec![16384, 0, 65536]
        );
        assert_eq!(
            layer_targets_from_rates(1, pixels, 2.0, Some(0.5)),
            Err(PcrdError::LayerCountMismatch)
        );
        assert_eq!(layer_targets_from_rates(2, pixels, 0.0, None), Err(PcrdError::InvalidRate));
        assert_eq!(layer_targets_from_rates(2, pixels, 1.0, Some(1.5)), Err(PcrdError::InvalidRate));
    }

    #[test]
    fn test_interpolation_between_sized_layers() {
        let t = interpolate_thresholds(Some((0, 40000)), (4, 32000), 1, 256);
        assert_eq!(t, vec![38000, 36000, 34000]);
    }

    #[test]
    fn test_interpolation_before_first_sized_layer() {
        let t = interpolate_thresholds(None, (2, 30000), 0, 256);
        assert_eq!(t, vec![30512, 30256]);
        let t = interpolate_thresholds(None, (2, 65400), 0, 256);
        assert_eq!(t, vec![65535, 65535]);
    }

    #[test]
    fn test_scaling() {
        assert_eq!(scale_targets(&[100, 0, 400], 0.5), vec![50, 0, 200]);
        assert_eq!(scale_targets(&[100, 0, 400], 1.0), vec![100, 0, 400]);
        assert_eq!(scale_targets(&[1], 0.01), vec![1]);
    }
}
