//! Sync failure taxonomy.

use rtc_common::{RegisterRange, RtcError};
use thiserror::Error;

/// Why a device sync stopped early or finished unverified.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    /// Transport could not be established within the timeout.
    #[error("connect failed: {0}")]
    ConnectFailure(#[source] RtcError),

    /// Register read returned an error or an undersized payload.
    #[error("read of input registers {range} failed: {source}")]
    ReadFailure {
        /// Registers requested.
        range: RegisterRange,
        /// Underlying error.
        #[source]
        source: RtcError,
    },

    /// Epoch or millisecond register write was rejected.
    #[error("write of holding registers {range} failed: {source}")]
    WriteFailure {
        /// Registers written.
        range: RegisterRange,
        /// Underlying error.
        #[source]
        source: RtcError,
    },

    /// The read-back after a successful write failed.
    #[error("read after write failed: {0}")]
    VerifyWarning(#[source] RtcError),
}

impl SyncError {
    /// Short machine-readable name of the failure class.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectFailure(_) => "connect",
            Self::ReadFailure { .. } => "read",
            Self::WriteFailure { .. } => "write",
            Self::VerifyWarning(_) => "verify",
        }
    }

    /// The error reported by the transport or codec.
    #[must_use]
    pub fn cause(&self) -> &RtcError {
        match self {
            Self::ConnectFailure(e) | Self::VerifyWarning(e) => e,
            Self::ReadFailure { source, .. } | Self::WriteFailure { source, .. } => source,
        }
    }
}
