//! Error taxonomy of the ingestion pipeline.
//!
//! Transport and persistence faults are recoverable and handled by the
//! ingestion loop. `TransportError::Unavailable` only appears at startup and is
//! fatal. `DecodeError` and `WindowError` are contract violations between
//! components and never occur when the transport and loop behave.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    /// The device could not be opened at startup.
    #[error("serial device {port} unavailable: {source}")]
    Unavailable {
        port: String,
        #[source]
        source: std::io::Error,
    },

    /// The link failed during operation; the next read reconnects.
    #[error("serial link fault on {port}: {reason}")]
    Fault { port: String, reason: String },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame size mismatch: expected {expected} bytes, got {actual}")]
    FrameSizeMismatch { expected: usize, actual: usize },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WindowError {
    #[error("rolling window holds no samples")]
    EmptyWindow,
}

/// An event could not be written to durable storage and was dropped.
#[derive(Error, Debug)]
#[error("persistence fault: {0}")]
pub struct PersistenceFault(pub String);

impl From<rusqlite::Error> for PersistenceFault {
    fn from(err: rusqlite::Error) -> Self {
        PersistenceFault(err.to_string())
    }
}

impl From<std::io::Error> for PersistenceFault {
    fn from(err: std::io::Error) -> Self {
        PersistenceFault(err.to_string())
    }
}

impl From<serde_json::Error> for PersistenceFault {
    fn from(err: serde_json::Error) -> Self {
        PersistenceFault(err.to_string())
    }
}

/// A legacy text line that could not be interpreted.
#[derive(Error, Debug)]
pub enum LineError {
    #[error("line is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("line is missing field '{0}'")]
    MissingField(&'static str),

    #[error("field '{field}' is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
}
