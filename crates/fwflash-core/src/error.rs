//! Flash job failure taxonomy.
//!
//! Every terminal failure of a flash operation is one of the variants of
//! [`FlashError`]. Automation branches on [`FailureReason`], whose string
//! identifiers are stable.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::TransportError;

/// Stable identifier of a failure, carried by `PhaseEvent::Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    SourceNotFound,
    DownloadFailed,
    MalformedChecksum,
    ChecksumMismatch,
    Busy,
    EraseError,
    TransportError,
    WriteVerificationFailed,
    NoResponse,
    Cancelled,
}

impl FailureReason {
    pub const ALL: [FailureReason; 10] = [
        FailureReason::SourceNotFound,
        FailureReason::DownloadFailed,
        FailureReason::MalformedChecksum,
        FailureReason::ChecksumMismatch,
        FailureReason::Busy,
        FailureReason::EraseError,
        FailureReason::TransportError,
        FailureReason::WriteVerificationFailed,
        FailureReason::NoResponse,
        FailureReason::Cancelled,
    ];

    /// Identifier used in logs and by downstream automation.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::SourceNotFound => "source_not_found",
            FailureReason::DownloadFailed => "download_failed",
            FailureReason::MalformedChecksum => "malformed_checksum",
            FailureReason::ChecksumMismatch => "checksum_mismatch",
            FailureReason::Busy => "busy",
            FailureReason::EraseError => "erase_error",
            FailureReason::TransportError => "transport_error",
            FailureReason::WriteVerificationFailed => "write_verification_failed",
            FailureReason::NoResponse => "no_response",
            FailureReason::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum FlashError {
    #[error("Image source not found: {path}")]
    SourceNotFound { path: PathBuf },

    #[error("Download of {url} failed: {message}")]
    DownloadFailed { url: String, message: String },

    #[error("Malformed checksum: {value:?}")]
    MalformedChecksum { value: String },

    #[error("Checksum mismatch: expected {expected}, computed {computed}")]
    ChecksumMismatch { expected: String, computed: String },

    #[error("A flash job is already in progress on this target")]
    Busy,

    #[error("Erase failed after {attempts} attempts: {source}")]
    EraseError {
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("Transport failure at offset {offset:#x} after {attempts} attempts: {source}")]
    TransportError {
        offset: usize,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("Write verification failed: expected {expected}, target reported {reported}")]
    WriteVerificationFailed { expected: String, reported: String },

    #[error("Target is not responding")]
    NoResponse,

    #[error("Flash job cancelled at offset {cursor:#x}")]
    Cancelled { cursor: usize },
}

impl FlashError {
    pub fn reason(&self) -> FailureReason {
        match self {
            FlashError::SourceNotFound { .. } => FailureReason::SourceNotFound,
            FlashError::DownloadFailed { .. } => FailureReason::DownloadFailed,
            FlashError::MalformedChecksum { .. } => FailureReason::MalformedChecksum,
            FlashError::ChecksumMismatch { .. } => FailureReason::ChecksumMismatch,
            FlashError::Busy => FailureReason::Busy,
            FlashError::EraseError { .. } => FailureReason::EraseError,
            FlashError::TransportError { .. } => FailureReason::TransportError,
            FlashError::WriteVerificationFailed { .. } => FailureReason::WriteVerificationFailed,
            FlashError::NoResponse => FailureReason::NoResponse,
            FlashError::Cancelled { .. } => FailureReason::Cancelled,
        }
    }

    /// Whether the failure came from talking to the target rather than
    /// from the image or the caller.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            FlashError::EraseError { .. } | FlashError::TransportError { .. }
        )
    }
}
