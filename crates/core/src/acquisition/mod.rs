use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    time::Instant,
};

use crossbeam_channel::{Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::{
    LogRecord, LoggerError, PlaybackEngine, PlaybackSequencer, RateEstimate, RecordWriter, Result,
    SampleRateEstimator, SharedClock,
};

/// One accelerometer reading as delivered by the sensor subsystem.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSample {
    pub arrival: Instant,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl SensorSample {
    pub fn new(arrival: Instant, x: f64, y: f64, z: f64) -> Self {
        Self { arrival, x, y, z }
    }
}

/// Operator-facing notifications. Published without blocking; a slow
/// observer may miss some.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Notice {
    RateUpdated(RateEstimate),
    WriteFailed { consecutive: u32, error: String },
    /// Appends have failed `consecutive` times in a row.
    PersistentWriteFailure { consecutive: u32 },
    WriteRecovered { after: u32 },
    /// The last clip of the window completed. The log stays open.
    TestFinished,
    /// Playback stopped early because the next clip could not be brought up.
    /// Like [`Notice::TestFinished`], the log stays open until the test is
    /// ended.
    TestAborted { reason: String },
}

/// Publishes a notice without ever blocking the caller.
pub(crate) fn publish(notices: &Sender<Notice>, notice: Notice) {
    match notices.try_send(notice) {
        Ok(()) => {}
        Err(TrySendError::Full(notice)) => {
            tracing::debug!(?notice, "notice queue full, dropping");
        }
        Err(TrySendError::Disconnected(_)) => {}
    }
}

struct AcquisitionInner {
    estimator: SampleRateEstimator,
    writer: Option<RecordWriter>,
    consecutive_failures: u32,
}

/// Turns sensor events into log records.
///
/// The whole handler runs under one lock, so events are estimated and
/// appended strictly in the order they are delivered.
pub struct AcquisitionCore<E: PlaybackEngine> {
    sequencer: Arc<PlaybackSequencer<E>>,
    clock: SharedClock,
    notices: Sender<Notice>,
    failure_threshold: u32,
    inner: Mutex<AcquisitionInner>,
}

impl<E: PlaybackEngine> AcquisitionCore<E> {
    pub fn new(
        sequencer: Arc<PlaybackSequencer<E>>,
        clock: SharedClock,
        batch_size: u32,
        failure_threshold: u32,
        notices: Sender<Notice>,
    ) -> Self {
        let estimator = SampleRateEstimator::with_batch_size(clock.now(), batch_size);
        Self {
            sequencer,
            clock,
            notices,
            failure_threshold: failure_threshold.max(1),
            inner: Mutex::new(AcquisitionInner {
                estimator,
                writer: None,
                consecutive_failures: 0,
            }),
        }
    }

    /// Starts recording into `writer`. A previously attached writer is
    /// returned to the caller.
    pub fn attach_writer(&self, writer: RecordWriter) -> Result<Option<RecordWriter>> {
        let mut inner = self.lock_inner()?;
        inner.consecutive_failures = 0;
        Ok(inner.writer.replace(writer))
    }

    pub fn detach_writer(&self) -> Result<Option<RecordWriter>> {
        Ok(self.lock_inner()?.writer.take())
    }

    pub fn is_recording(&self) -> bool {
        self.lock_inner()
            .map(|inner| inner.writer.is_some())
            .unwrap_or(false)
    }

    pub fn current_rate(&self) -> Option<RateEstimate> {
        self.lock_inner().ok()?.estimator.latest()
    }

    /// Sensor callback. Never fails: append errors are logged and published
    /// as notices, and acquisition carries on with the next event.
    pub fn on_sensor_event(&self, sample: SensorSample) {
        let mut inner = match self.lock_inner() {
            Ok(inner) => inner,
            Err(err) => {
                tracing::error!(%err, "dropping sensor event");
                return;
            }
        };

        if let Some(rate) = inner.estimator.on_sample_arrived(sample.arrival) {
            publish(&self.notices, Notice::RateUpdated(rate));
        }

        if inner.writer.is_none() {
            return;
        }

        let position = match self.sequencer.current_position() {
            Ok(position) => position,
            Err(err) => {
                tracing::warn!(%err, "playback state unavailable, logging without it");
                None
            }
        };
        let record = LogRecord::new(
            self.clock.wall_clock_millis(),
            [sample.x, sample.y, sample.z],
            position,
        );

        let inner = &mut *inner;
        let Some(writer) = inner.writer.as_mut() else {
            return;
        };
        match writer.append(&record) {
            Ok(()) => {
                if inner.consecutive_failures > 0 {
                    tracing::info!(after = inner.consecutive_failures, "log appends recovered");
                    publish(
                        &self.notices,
                        Notice::WriteRecovered {
                            after: inner.consecutive_failures,
                        },
                    );
                    inner.consecutive_failures = 0;
                }
            }
            Err(err) => {
                inner.consecutive_failures += 1;
                let consecutive = inner.consecutive_failures;
                tracing::warn!(%err, consecutive, "failed to append log record");
                publish(
                    &self.notices,
                    Notice::WriteFailed {
                        consecutive,
                        error: err.to_string(),
                    },
                );
                if consecutive == self.failure_threshold {
                    tracing::error!(consecutive, "log appends keep failing");
                    publish(&self.notices, Notice::PersistentWriteFailure { consecutive });
                }
            }
        }
    }

    fn lock_inner(&self) -> Result<MutexGuard<'_, AcquisitionInner>> {
        self.inner
            .lock()
            .map_err(|_| LoggerError::msg("acquisition state has been poisoned"))
    }
}

impl<E: PlaybackEngine> fmt::Debug for AcquisitionCore<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquisitionCore")
            .field("recording", &self.is_recording())
            .field("failure_threshold", &self.failure_threshold)
            .finish()
    }
}
