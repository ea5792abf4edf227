use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Number of sensor arrivals per rate estimate.
pub const DEFAULT_BATCH_SIZE: u32 = 25;

/// Sampling frequency derived from the most recent batch of arrivals.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RateEstimate {
    pub hz: f64,
}

/// Fixed-window sample rate estimator. Every `batch_size` arrivals it divides
/// the batch size by the time taken since the previous batch boundary.
///
/// The first batch is measured from the construction instant, so the first
/// estimate includes sensor start-up latency.
#[derive(Debug, Clone)]
pub struct SampleRateEstimator {
    batch_size: u32,
    count: u32,
    last_batch: Instant,
    latest: Option<RateEstimate>,
}

impl SampleRateEstimator {
    /// Creates an estimator using the default batch of 25 samples.
    pub fn new(now: Instant) -> Self {
        Self::with_batch_size(now, DEFAULT_BATCH_SIZE)
    }

    pub fn with_batch_size(now: Instant, batch_size: u32) -> Self {
        Self {
            batch_size: batch_size.max(1),
            count: 0,
            last_batch: now,
            latest: None,
        }
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// Most recently emitted estimate, if a full batch has been observed.
    pub fn latest(&self) -> Option<RateEstimate> {
        self.latest
    }

    /// Records one arrival. Returns a fresh estimate when the arrival closes a
    /// batch.
    pub fn on_sample_arrived(&mut self, instant: Instant) -> Option<RateEstimate> {
        self.count += 1;
        if self.count < self.batch_size {
            return None;
        }

        let elapsed = instant.saturating_duration_since(self.last_batch);
        self.count = 0;
        self.last_batch = instant;

        // A zero-length batch has no meaningful frequency; the window restarts.
        if elapsed.is_zero() {
            return None;
        }

        let estimate = RateEstimate {
            hz: f64::from(self.batch_size) / elapsed.as_secs_f64(),
        };
        self.latest = Some(estimate);
        Some(estimate)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn constant_spacing_yields_inverse_interval() {
        let origin = Instant::now();
        let mut estimator = SampleRateEstimator::new(origin);
        let interval = Duration::from_millis(5);

        let mut emitted = Vec::new();
        for i in 1..=25u32 {
            if let Some(rate) = estimator.on_sample_arrived(origin + interval * i) {
                emitted.push(rate);
            }
        }

        assert_eq!(emitted.len(), 1);
        assert!((emitted[0].hz - 200.0).abs() < 1e-6);
        assert_eq!(estimator.latest(), Some(emitted[0]));
    }

    #[test]
    fn partial_batch_never_emits() {
        let origin = Instant::now();
        let mut estimator = SampleRateEstimator::new(origin);

        for i in 1..25u32 {
            let arrival = origin + Duration::from_millis(u64::from(i));
            assert!(estimator.on_sample_arrived(arrival).is_none());
        }
        assert!(estimator.latest().is_none());
    }

    #[test]
    fn batches_do_not_overlap() {
        let origin = Instant::now();
        let mut estimator = SampleRateEstimator::with_batch_size(origin, 4);

        let mut rates = Vec::new();
        // First batch at 10 ms spacing, second at 20 ms spacing.
        let mut t = origin;
        for step in [10u64, 10, 10, 10, 20, 20, 20, 20] {
            t += Duration::from_millis(step);
            rates.extend(estimator.on_sample_arrived(t));
        }

        assert_eq!(rates.len(), 2);
        assert!((rates[0].hz - 100.0).abs() < 1e-6);
        assert!((rates[1].hz - 50.0).abs() < 1e-6);
    }

    #[test]
    fn zero_length_batch_is_skipped() {
        let origin = Instant::now();
        let mut estimator = SampleRateEstimator::with_batch_size(origin, 2);

        assert!(estimator.on_sample_arrived(origin).is_none());
        assert!(estimator.on_sample_arrived(origin).is_none());
        assert!(estimator.latest().is_none());
    }
}
