//! Error types shared by the codec, transport and configuration layers.

use thiserror::Error;

/// Errors raised below the sync layer: transport, payload and configuration faults.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RtcError {
    /// Configuration or initialization error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Fieldbus communication or device error.
    #[error("fieldbus error: {0}")]
    FieldbusError(String),

    /// I/O operation error.
    #[error("I/O error: {0}")]
    IoError(String),

    /// Register payload could not be decoded.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// Convenience type alias for fallible operations.
pub type RtcResult<T> = Result<T, RtcError>;
