//! Core library for the accelerometer and audio playback logger.
//!
//! A test run plays a window of audio clips back to back while every
//! accelerometer event is appended to a log together with the playing clip
//! and how far into it playback is. Each module owns one part of that loop
//! (timing, rate estimation, clip sequencing, log writing) and
//! [`TestController`] ties them together behind the operations an operator
//! uses.

pub mod acquisition;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod playback;
pub mod rate;
pub mod record;
pub mod sequencer;

pub use acquisition::{AcquisitionCore, Notice, SensorSample};
pub use catalog::{Clip, ClipCatalog, ClipSource};
pub use clock::{ClockSource, ManualClock, SharedClock, SystemClock};
pub use config::{AppConfig, CatalogConfig, LogConfig, SensorConfig};
pub use controller::TestController;
pub use error::{LoggerError, Result};
pub use playback::{ClipPlayer, Completion, CompletionSignal, PlaybackEngine};
pub use rate::{RateEstimate, SampleRateEstimator};
pub use record::{log_file_name, read_log, LogContents, LogRecord, RecordWriter, LOG_HEADER};
pub use sequencer::{PlaybackPosition, PlaybackSequencer, PlaybackWindow, TrackDisplay, Transition};
