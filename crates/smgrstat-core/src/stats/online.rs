use serde::{Deserialize, Serialize};

/// Streaming mean/variance accumulator (Welford).
///
/// Used for inter-arrival times and for sequential run lengths. `m2` is the
/// sum of squared deviations from the current mean.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OnlineStats {
    pub count: u64,
    pub mean: f64,
    pub m2: f64,
}

impl OnlineStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Sample variance; 0 with fewer than two observations.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        self.m2 / (self.count - 1) as f64
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Coefficient of variation (stddev / |mean|). Above 1 means bursty.
    pub fn coefficient_of_variation(&self) -> f64 {
        if self.count < 2 || self.mean == 0.0 {
            return 0.0;
        }
        self.stddev() / self.mean.abs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_sequence_has_no_variance() {
        let mut s = OnlineStats::new();
        for _ in 0..10 {
            s.record(7.5);
        }
        assert_eq!(s.count, 10);
        assert_eq!(s.mean, 7.5);
        assert_eq!(s.variance(), 0.0);
        assert_eq!(s.coefficient_of_variation(), 0.0);
    }

    #[test]
    fn test_one_to_five() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        let mut s = OnlineStats::new();
        for v in values {
            s.record(v);
        }

        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let closed_form = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);

        assert!((s.mean - 3.0).abs() < 1e-12);
        assert!((s.variance() - 2.5).abs() < 1e-12);
        assert!((s.variance() - closed_form).abs() < 1e-12);
        assert!((s.coefficient_of_variation() - 2.5f64.sqrt() / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_small_counts_and_zero_mean() {
        let mut s = OnlineStats::new();
        assert_eq!(s.variance(), 0.0);
        s.record(4.0);
        assert_eq!(s.variance(), 0.0);
        assert_eq!(s.coefficient_of_variation(), 0.0);

        let mut z = OnlineStats::new();
        z.record(-1.0);
        z.record(1.0);
        assert_eq!(z.mean, 0.0);
        assert_eq!(z.coefficient_of_variation(), 0.0);
        assert!(z.variance() > 0.0);
    }

    #[test]
    fn test_reset() {
        let mut s = OnlineStats::new();
        s.record(1.0);
        s.record(9.0);
        s.reset();
        assert_eq!(s, OnlineStats::default());
    }
}
