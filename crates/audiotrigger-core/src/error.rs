//! Error taxonomy for the trigger engine
//!
//! Configuration and capture-source errors are fatal at startup.
//! Persistence and publish errors are recoverable: they are counted and
//! logged, and never interrupt block ingestion.

use std::path::PathBuf;
use thiserror::Error;

/// Invalid or unreadable configuration (fatal at startup)
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid calibration in {path}: {reason}")]
    Calibration { path: PathBuf, reason: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Audio source could not be opened or stopped delivering (fatal)
#[derive(Error, Debug)]
pub enum CaptureSourceError {
    #[error("Input device not found: {0}")]
    DeviceNotFound(String),

    #[error("No default input device available")]
    NoDefaultDevice,

    #[error("Failed to open input stream: {0}")]
    StreamError(String),

    #[error("Failed to read audio file {path}: {reason}")]
    File { path: PathBuf, reason: String },

    #[error("Audio source already started")]
    AlreadyStarted,

    #[error("Live capture support not compiled in (enable the `capture` feature)")]
    Unsupported,
}

/// Event could not be persisted (recoverable, event dropped)
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Failed to create event directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write audio {path}: {source}")]
    Audio {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode event metadata: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Event writer queue full, event {event_id} dropped")]
    QueueFull { event_id: u64 },

    #[error("Event writer stopped, event {event_id} dropped")]
    WriterStopped { event_id: u64 },
}

/// Message could not be published (recoverable)
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Message bus unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to encode payload for {topic}: {source}")]
    Encode {
        topic: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Publish queue full, message for {topic} dropped")]
    QueueFull { topic: String },

    #[error("Publisher stopped")]
    Stopped,
}

/// Fatal engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Capture(#[from] CaptureSourceError),

    #[error("Failed to start {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_message() {
        let err = ConfigError::invalid("thresh_a80", "must be finite");
        assert_eq!(
            err.to_string(),
            "Invalid value for thresh_a80: must be finite"
        );
    }

    #[test]
    fn test_engine_error_from_capture() {
        let err: EngineError = CaptureSourceError::DeviceNotFound("hw:9".into()).into();
        assert_eq!(err.to_string(), "Input device not found: hw:9");
    }
}
