//! Fixed-bin log2 latency histogram.
//!
//! Bin layout (microseconds):
//!
//! ```text
//! bin 0        exactly 0 (cache hit / instant)
//! bin i        [2^(i-1), 2^i)        for 1 <= i <= 30
//! bin 31       >= 2^30 (overflow, ~1073 s)
//! ```
//!
//! The bin of a value is its highest set bit plus one, clamped to the
//! overflow bin, so recording is a single bit scan.

use serde::{Deserialize, Serialize};

/// Number of bins in every latency histogram.
pub const HIST_BINS: usize = 32;

/// Error returned by [`percentile`] for arguments outside its contract.
#[derive(Debug, Clone, PartialEq)]
pub enum HistogramError {
    /// Requested fraction is not within `[0.0, 1.0]`.
    PercentileOutOfRange(f64),
    /// Bin array does not have exactly [`HIST_BINS`] elements.
    BinCountMismatch(usize),
}

impl std::fmt::Display for HistogramError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HistogramError::PercentileOutOfRange(p) => {
                write!(f, "percentile must be between 0.0 and 1.0, got {}", p)
            }
            HistogramError::BinCountMismatch(n) => write!(
                f,
                "histogram array must have {} elements, got {}",
                HIST_BINS, n
            ),
        }
    }
}

impl std::error::Error for HistogramError {}

/// Latency histogram with count, sum, min and max.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub bins: [u64; HIST_BINS],
    /// Total observations.
    pub count: u64,
    /// Cumulative microseconds.
    pub total_us: u64,
    /// Minimum observed; `u64::MAX` while empty. Use [`Histogram::min_us`].
    pub min_us: u64,
    pub max_us: u64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            bins: [0; HIST_BINS],
            count: 0,
            total_us: 0,
            min_us: u64::MAX,
            max_us: 0,
        }
    }
}

/// Returns the bin index for a value in microseconds.
#[inline]
pub fn bin_for(value_us: u64) -> usize {
    if value_us == 0 {
        return 0;
    }
    let highest_bit = (u64::BITS - 1 - value_us.leading_zeros()) as usize;
    (highest_bit + 1).min(HIST_BINS - 1)
}

/// Lower bound (inclusive) of a bin in microseconds.
#[inline]
pub fn bin_lower_bound(bin: usize) -> u64 {
    if bin == 0 { 0 } else { 1u64 << (bin - 1) }
}

impl Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one observation.
    #[inline]
    pub fn record(&mut self, value_us: u64) {
        self.bins[bin_for(value_us)] += 1;
        self.count += 1;
        self.total_us = self.total_us.saturating_add(value_us);
        if value_us < self.min_us {
            self.min_us = value_us;
        }
        if value_us > self.max_us {
            self.max_us = value_us;
        }
    }

    /// Resets to the empty state, min back to the sentinel.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Minimum observed latency, `None` while empty.
    pub fn min_us(&self) -> Option<u64> {
        (self.count > 0).then_some(self.min_us)
    }

    pub fn mean_us(&self) -> Option<f64> {
        (self.count > 0).then(|| self.total_us as f64 / self.count as f64)
    }

    /// Convenience wrapper around [`percentile`] for this histogram's bins.
    pub fn percentile(&self, p: f64) -> Result<Option<f64>, HistogramError> {
        percentile(&self.bins, p)
    }
}

/// Estimates a percentile from a bin-count array.
///
/// Returns the lower bound of the first bin whose cumulative count reaches
/// `ceil(total * p)` (at least 1). `Ok(None)` when the histogram is empty.
pub fn percentile(bins: &[u64], p: f64) -> Result<Option<f64>, HistogramError> {
    if !(0.0..=1.0).contains(&p) {
        return Err(HistogramError::PercentileOutOfRange(p));
    }
    if bins.len() != HIST_BINS {
        return Err(HistogramError::BinCountMismatch(bins.len()));
    }

    let total: u64 = bins.iter().sum();
    if total == 0 {
        return Ok(None);
    }

    let target = ((total as f64 * p).ceil() as u64).max(1);
    let mut cumulative = 0u64;
    for (i, &n) in bins.iter().enumerate() {
        cumulative += n;
        if cumulative >= target {
            return Ok(Some(bin_lower_bound(i) as f64));
        }
    }

    // cumulative == total >= target after the last bin
    Ok(Some(bin_lower_bound(HIST_BINS - 1) as f64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bin_boundaries() {
        assert_eq!(bin_for(0), 0);
        assert_eq!(bin_for(1), 1);
        assert_eq!(bin_for(2), 2);
        assert_eq!(bin_for(3), 2);
        assert_eq!(bin_for(4), 3);
        assert_eq!(bin_for(7), 3);
        assert_eq!(bin_for(1023), 10);
        assert_eq!(bin_for(1024), 11);
        assert_eq!(bin_for((1 << 29) + 5), 30);
        assert_eq!(bin_for(1 << 30), 31);
        assert_eq!(bin_for(u64::MAX), 31);
    }

    #[test]
    fn test_record_tracks_count_sum_min_max() {
        let mut h = Histogram::new();
        assert_eq!(h.min_us(), None);
        assert_eq!(h.mean_us(), None);

        for v in [5, 0, 100, 3] {
            h.record(v);
        }
        assert_eq!(h.count, 4);
        assert_eq!(h.total_us, 108);
        assert_eq!(h.min_us(), Some(0));
        assert_eq!(h.max_us, 100);
        assert_eq!(h.bins[0], 1);
        assert_eq!(h.bins[2], 1);
        assert_eq!(h.bins[3], 1);
        assert_eq!(h.bins[7], 1);
    }

    #[test]
    fn test_bins_sum_to_count() {
        let mut h = Histogram::new();
        let mut v = 1u64;
        for i in 0..500u64 {
            v = v.wrapping_mul(6364136223846793005).wrapping_add(i);
            h.record(v >> (i % 64));
            assert_eq!(h.bins.iter().sum::<u64>(), h.count);
        }
    }

    #[test]
    fn test_reset_restores_sentinel() {
        let mut h = Histogram::new();
        h.record(42);
        h.reset();
        assert_eq!(h, Histogram::default());
        assert_eq!(h.min_us, u64::MAX);
        assert_eq!(h.min_us(), None);
    }

    #[test]
    fn test_percentile_max_is_tightest_lower_bound() {
        for v in [0u64, 1, 2, 3, 9, 1000, 65_535, 1 << 30, u64::MAX] {
            let mut h = Histogram::new();
            h.record(v);
            let p100 = h.percentile(1.0).unwrap().unwrap();
            assert!(p100 <= v as f64, "lower bound {} > value {}", p100, v);
            assert_eq!(p100, bin_lower_bound(bin_for(v)) as f64);
        }
    }

    #[test]
    fn test_percentile_median() {
        let mut bins = [0u64; HIST_BINS];
        bins[1] = 5; // [1, 2)
        bins[4] = 5; // [8, 16)
        assert_eq!(percentile(&bins, 0.5).unwrap(), Some(1.0));
        assert_eq!(percentile(&bins, 0.51).unwrap(), Some(8.0));
        // p = 0 clamps the target to the first observation
        assert_eq!(percentile(&bins, 0.0).unwrap(), Some(1.0));
    }

    #[test]
    fn test_percentile_empty_and_errors() {
        let bins = [0u64; HIST_BINS];
        assert_eq!(percentile(&bins, 0.9).unwrap(), None);
        assert_eq!(
            percentile(&bins, 1.5),
            Err(HistogramError::PercentileOutOfRange(1.5))
        );
        assert_eq!(
            percentile(&bins, -0.1),
            Err(HistogramError::PercentileOutOfRange(-0.1))
        );
        assert_eq!(
            percentile(&[1, 2, 3], 0.5),
            Err(HistogramError::BinCountMismatch(3))
        );
    }
}
