//! Error types for recorder operations.

use std::fmt;

/// Error type for recorder operations.
#[derive(Debug)]
pub enum RecorderError {
    /// Startup failure (directories, config, HTTP client construction)
    Setup(String),
    /// The external capture mechanism could not be driven
    Capture(String),
    /// Network failure while probing broadcast status
    Network(String),
    /// The broadcast tag could not be parsed
    InvalidTag(String),
    /// Segment recording was already started for this broadcast
    AlreadyActive,
}

impl fmt::Display for RecorderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecorderError::Setup(msg) => write!(f, "Setup failed: {}", msg),
            RecorderError::Capture(msg) => write!(f, "Capture control failed: {}", msg),
            RecorderError::Network(msg) => write!(f, "Network error: {}", msg),
            RecorderError::InvalidTag(msg) => write!(f, "Invalid broadcast tag: {}", msg),
            RecorderError::AlreadyActive => write!(f, "Segment recording already started"),
        }
    }
}

impl std::error::Error for RecorderError {}

impl From<RecorderError> for String {
    fn from(err: RecorderError) -> Self {
        err.to_string()
    }
}
