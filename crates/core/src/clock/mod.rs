use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

/// Monotonic time source shared by every component that measures elapsed
/// time. Implementations are stateless from the caller's point of view and
/// may be cloned freely behind an [`Arc`].
pub trait ClockSource: Send + Sync {
    /// Returns the current monotonic instant.
    fn now(&self) -> Instant;

    /// Milliseconds since the Unix epoch from the (non-monotonic) wall clock.
    /// Only used for the persisted timestamp column.
    fn wall_clock_millis(&self) -> i64;

    /// Time elapsed between `since` and now, saturating at zero.
    fn elapsed(&self, since: Instant) -> Duration {
        self.now().saturating_duration_since(since)
    }
}

/// Shared handle type used across the crate.
pub type SharedClock = Arc<dyn ClockSource>;

/// Clock backed by [`Instant::now`] and the system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    pub fn shared() -> SharedClock {
        Arc::new(Self)
    }
}

impl ClockSource for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_clock_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to. Both the monotonic and the wall clock
/// advance together.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    wall_origin_millis: i64,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new(wall_origin_millis: i64) -> Self {
        Self {
            origin: Instant::now(),
            wall_origin_millis,
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, delta: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += delta;
    }

    pub fn advance_millis(&self, millis: u64) {
        self.advance(Duration::from_millis(millis));
    }

    fn offset(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ClockSource for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.offset()
    }

    fn wall_clock_millis(&self) -> i64 {
        self.wall_origin_millis + self.offset().as_millis() as i64
    }
}
