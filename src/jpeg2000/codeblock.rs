//! Code-block truncation tables as delivered by the block coder.

use crate::error::PcrdError;

/// A candidate truncation point of an embedded code-block bit-stream.
///
/// Point `i` of a table corresponds to `i` coding passes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TruncationPoint {
    /// Cumulative number of code bytes up to and including this point.
    pub length: u32,
    /// Logarithmic distortion-length slope of the point.
    pub slope: u16,
    /// Cumulative distortion reduction achieved by this point.
    pub distortion_reduction: f64,
}

impl TruncationPoint {
    pub fn new(length: u32, slope: u16) -> Self {
        Self {
            length,
            slope,
            distortion_reduction: 0.0,
        }
    }
}

/// An immutable, fully encoded code-block.
#[derive(Debug, Clone)]
pub struct CodeBlock {
    points: Vec<TruncationPoint>,
    missing_msbs: u8,
    data: Vec<u8>,
}

impl CodeBlock {
    /// Validates the block coder contract: a non-empty table starting with
    /// the zero-length baseline, non-decreasing lengths, strictly decreasing
    /// slopes after the baseline and enough code bytes for the last point.
    pub fn new(
        points: Vec<TruncationPoint>,
        missing_msbs: u8,
        data: Vec<u8>,
    ) -> Result<Self, PcrdError> {
        let Some(baseline) = points.first() else {
            return Err(PcrdError::EmptyTruncationTable);
        };
        if baseline.length != 0 {
            log::error!("truncation table does not start at length 0");
            return Err(PcrdError::InvalidTruncationTable);
        }
        for pair in points.windows(2) {
            if pair[1].length < pair[0].length {
                log::error!("truncation lengths decrease: {} -> {}", pair[0].length, pair[1].length);
                return Err(PcrdError::InvalidTruncationTable);
            }
        }
        for pair in points[1..].windows(2) {
            if pair[1].slope >= pair[0].slope {
                log::error!("truncation slopes not decreasing: {} -> {}", pair[0].slope, pair[1].slope);
                return Err(PcrdError::InvalidTruncationTable);
            }
        }
        let last = points[points.len() - 1].length as usize;
        if data.len() < last {
            log::error!("code-block holds {} bytes, table needs {}", data.len(), last);
            return Err(PcrdError::InvalidTruncationTable);
        }

        Ok(Self {
            points,
            missing_msbs,
            data,
        })
    }

    /// Builds a block from `(cumulative_length, slope)` pairs with filler
    /// code bytes, for callers that only care about rate control.
    pub fn from_pairs(pairs: &[(u32, u16)], missing_msbs: u8) -> Result<Self, PcrdError> {
        let points: Vec<TruncationPoint> = pairs
            .iter()
            .map(|&(length, slope)| TruncationPoint::new(length, slope))
            .collect();
        let len = points.last().map_or(0, |p| p.length as usize);
        let data = (0..len).map(|i| (i % 251) as u8).collect();
        Self::new(points, missing_msbs, data)
    }

    pub fn points(&self) -> &[TruncationPoint] {
        &self.points
    }

    /// Number of coding passes available beyond the baseline.
    pub fn num_passes(&self) -> usize {
        self.points.len() - 1
    }

    pub fn missing_msbs(&self) -> u8 {
        self.missing_msbs
    }

    /// Index of the last truncation point with slope >= `threshold`
    /// (0 when only the baseline qualifies).
    pub fn truncation_index(&self, threshold: u16) -> usize {
        // Slopes strictly decrease after the baseline.
        self.points[1..].partition_point(|p| p.slope >= threshold)
    }

    pub fn length_at(&self, index: usize) -> u32 {
        self.points[index].length
    }

    pub fn slope_at(&self, index: usize) -> u16 {
        self.points[index].slope
    }

    pub fn distortion_reduction_at(&self, index: usize) -> f64 {
        self.points[index].distortion_reduction
    }

    /// Code bytes needed to include every point with slope >= `threshold`.
    pub fn bytes_for(&self, threshold: u16) -> u32 {
        self.length_at(self.truncation_index(threshold))
    }

    /// Code bytes contributed by passes `from..to`.
    pub fn code_bytes(&self, from: usize, to: usize) -> &[u8] {
        let start = self.points[from].length as usize;
        let end = self.points[to].length as usize;
        &self.data[start..end]
    }

    /// Total code bytes held by the block.
    pub fn total_length(&self) -> u32 {
        self.points[self.points.len() - 1].length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_selects_points_at_or_above() {
        let block = CodeBlock::from_pairs(&[(0, 0), (10, 500), (25, 200)], 0).unwrap();
        assert_eq!(block.bytes_for(300), 10);
        assert_eq!(block.bytes_for(500), 10);
        assert_eq!(block.bytes_for(501), 0);
        assert_eq!(block.bytes_for(200), 25);
        assert_eq!(block.bytes_for(0), 25);
        assert_eq!(block.truncation_index(300), 1);
        assert_eq!(block.num_passes(), 2);
    }

    #[test]
    fn test_rejects_empty_table() {
        assert_eq!(
            CodeBlock::from_pairs(&[], 0).unwrap_err(),
            PcrdError::EmptyTruncationTable
        );
    }

    #[test]
    fn test_rejects_bad_tables() {
        assert_eq!(
            CodeBlock::from_pairs(&[(4, 0), (10, 500)], 0).unwrap_err(),
            PcrdError::InvalidTruncationTable
        );
        assert_eq!(
            CodeBlock::from_pairs(&[(0, 0), (10, 500), (20, 500)], 0).unwrap_err(),
            PcrdError::InvalidTruncationTable
        );
        assert_eq!(
            CodeBlock::from_pairs(&[(0, 0), (10, 500), (5, 400)], 0).unwrap_err(),
            PcrdError::InvalidTruncationTable
        );
        let short = CodeBlock::new(vec![TruncationPoint::new(0, 0), TruncationPoint::new(8, 9)], 0, vec![0; 4]);
        assert_eq!(short.unwrap_err(), PcrdError::InvalidTruncationTable);
    }

    #[test]
    fn test_code_bytes_slices() {
        let block = CodeBlock::from_pairs(&[(0, 0), (3, 900), (7, 100)], 2).unwrap();
        assert_eq!(block.code_bytes(0, 1), &[0, 1, 2]);
        assert_eq!(block.code_bytes(1, 2).len(), 4);
        assert_eq!(block.missing_msbs(), 2);
        assert_eq!(block.total_length(), 7);
    }
}
