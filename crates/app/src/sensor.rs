use std::time::{Duration, Instant};

use accel_logger_core::SensorSample;

const GRAVITY: f64 = 9.80665;

/// Synthetic 3-axis accelerometer: gravity on Z plus a few slow sinusoids so
/// the recorded columns are not constant.
#[derive(Debug, Clone)]
pub struct SimulatedAccelerometer {
    origin: Instant,
    interval: Duration,
}

impl SimulatedAccelerometer {
    pub fn new(rate_hz: f64) -> Self {
        let rate_hz = if rate_hz.is_finite() && rate_hz > 0.0 {
            rate_hz
        } else {
            100.0
        };
        Self {
            origin: Instant::now(),
            interval: Duration::from_secs_f64(1.0 / rate_hz),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Reading for an event that arrived at `arrival`.
    pub fn sample(&self, arrival: Instant) -> SensorSample {
        let t = arrival.saturating_duration_since(self.origin).as_secs_f64();
        SensorSample::new(
            arrival,
            0.15 * (t * 2.1).sin(),
            0.10 * (t * 3.7).cos(),
            GRAVITY + 0.05 * (t * 11.0).sin(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_default_rate() {
        let sensor = SimulatedAccelerometer::new(0.0);
        assert_eq!(sensor.interval(), Duration::from_millis(10));
    }

    #[test]
    fn z_axis_carries_gravity() {
        let sensor = SimulatedAccelerometer::new(200.0);
        let sample = sensor.sample(Instant::now());
        assert!((sample.z - GRAVITY).abs() < 0.1);
    }
}
