use std::path::PathBuf;

use thiserror::Error;

use crate::types::{HostId, SampleKindId, TimeRangeId};

/// Error type for every fallible operation in the collector core.
#[derive(Error, Debug)]
pub enum TimelineError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Configuration Error: {0}")]
    ConfigError(String),

    #[error("Background task error: {0}")]
    BackgroundTaskError(String),

    /// A backing log or catalog file failed its integrity checks.
    #[error("Corruption detected: {details}")]
    Corruption {
        details: String,
        path: Option<PathBuf>,
        offset: Option<u64>,
    },

    /// An encoded sample or timestamp stream could not be decoded.
    ///
    /// Fatal for the chunk being read, never for the process.
    #[error(
        "Corrupt encoding: {} (host={:?}, kind={:?}, range={:?})",
        .details,
        .host_id,
        .sample_kind_id,
        .time_range_id
    )]
    CorruptEncoding {
        details: String,
        host_id: Option<HostId>,
        sample_kind_id: Option<SampleKindId>,
        time_range_id: Option<TimeRangeId>,
    },

    #[error("Identifier resolution failed: {0}")]
    Resolution(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Collector is shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TimelineError {
    /// Shorthand for a context-free encoding error raised inside the codecs.
    pub(crate) fn corrupt(details: impl Into<String>) -> Self {
        TimelineError::CorruptEncoding {
            details: details.into(),
            host_id: None,
            sample_kind_id: None,
            time_range_id: None,
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for TimelineError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        TimelineError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}

impl From<bincode::Error> for TimelineError {
    fn from(err: bincode::Error) -> Self {
        TimelineError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TimelineError>;
