//! Scalar Kalman filter smoothing delay-gradient samples (ms/s) into a
//! congestion signal.

/// Default process noise (trust in the signal staying constant)
pub const DEFAULT_PROCESS_NOISE: f64 = 1e-3;

/// Default measurement noise (trust in each sample)
pub const DEFAULT_MEASUREMENT_NOISE: f64 = 0.1;

#[derive(Debug, Clone, PartialEq)]
pub struct DelayGradientFilter {
    process_noise: f64,
    measurement_noise: f64,
    estimate: f64,
    variance: f64,
}

impl DelayGradientFilter {
    pub fn new(process_noise: f64, measurement_noise: f64) -> Self {
        Self {
            process_noise,
            measurement_noise,
            estimate: 0.0,
            variance: 1.0,
        }
    }

    /// Predict-then-correct with one measurement; returns the new estimate.
    ///
    /// Non-finite measurements are ignored.
    pub fn update(&mut self, measurement: f64) -> f64 {
        if !measurement.is_finite() {
            return self.estimate;
        }

        // Predict: the state is modelled as constant, only uncertainty grows
        let predicted_variance = self.variance + self.process_noise;

        // Correct
        let gain = predicted_variance / (predicted_variance + self.measurement_noise);
        self.estimate += gain * (measurement - self.estimate);
        self.variance = (1.0 - gain) * predicted_variance;

        self.estimate
    }

    pub fn estimate(&self) -> f64 {
        self.estimate
    }

    pub fn variance(&self) -> f64 {
        self.variance
    }

    pub fn reset(&mut self) {
        self.estimate = 0.0;
        self.variance = 1.0;
    }
}

impl Default for DelayGradientFilter {
    fn default() -> Self {
        Self::new(DEFAULT_PROCESS_NOISE, DEFAULT_MEASUREMENT_NOISE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let filter = DelayGradientFilter::default();
        assert_eq!(filter.estimate(), 0.0);
        assert_eq!(filter.variance(), 1.0);
    }

    #[test]
    fn test_first_update_moves_most_of_the_way() {
        let mut filter = DelayGradientFilter::default();
        let estimate = filter.update(-2.0);
        // gain = 1.001 / 1.101
        assert!((estimate - (-2.0 * 1.001 / 1.101)).abs() < 1e-9);
        assert!(estimate < -1.0);
    }

    #[test]
    fn test_converges_to_constant_signal() {
        let mut filter = DelayGradientFilter::default();
        for _ in 0..200 {
            filter.update(6.0);
        }
        assert!((filter.estimate() - 6.0).abs() < 1e-3);
    }

    #[test]
    fn test_variance_shrinks_and_stays_positive() {
        let mut filter = DelayGradientFilter::default();
        let mut previous = filter.variance();
        for _ in 0..50 {
            filter.update(1.0);
            assert!(filter.variance() > 0.0);
            assert!(filter.variance() <= previous);
            previous = filter.variance();
        }
    }

    #[test]
    fn test_single_outlier_is_damped_after_warmup() {
        let mut filter = DelayGradientFilter::default();
        for _ in 0..100 {
            filter.update(0.0);
        }
        let estimate = filter.update(50.0);
        assert!(estimate < 10.0, "outlier passed through: {}", estimate);
    }

    #[test]
    fn test_non_finite_measurement_ignored() {
        let mut filter = DelayGradientFilter::default();
        filter.update(3.0);
        let before = filter.clone();
        filter.update(f64::NAN);
        filter.update(f64::INFINITY);
        assert_eq!(filter, before);
    }

    #[test]
    fn test_reset() {
        let mut filter = DelayGradientFilter::default();
        filter.update(4.0);
        filter.update(5.0);
        filter.reset();
        assert_eq!(filter.estimate(), 0.0);
        assert_eq!(filter.variance(), 1.0);
    }
}
