use std::path::PathBuf;

/// Result alias that carries the custom [`LoggerError`] type.
pub type Result<T> = std::result::Result<T, LoggerError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum LoggerError {
    /// The requested playback window does not fit the clip catalog. Raised
    /// before any playback or log resource is opened.
    #[error("invalid clip window {start}..{end} for a catalog of {len} clips")]
    InvalidRange { start: usize, end: usize, len: usize },
    /// A clip's byte source could not be opened or decoded.
    #[error("failed to prepare clip `{clip}`: {reason}")]
    Prepare { clip: String, reason: String },
    /// The log file for a test run could not be created.
    #[error("failed to create log file {path:?}: {source}")]
    LogCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// A single record could not be appended to the log.
    #[error("failed to append log record: {0}")]
    LogWrite(#[source] std::io::Error),
    /// Configuration could not be interpreted.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Internal faults such as poisoned locks.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl LoggerError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn prepare(clip: impl Into<String>, reason: impl ToString) -> Self {
        Self::Prepare {
            clip: clip.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<&str> for LoggerError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for LoggerError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
