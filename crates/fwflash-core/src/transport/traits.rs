//! Flash transport abstraction.
//!
//! Defines the `FlashTransport` trait for talking to a target's
//! non-volatile memory, allowing different implementations
//! (SPI NOR, file-backed, mock).

use async_trait::async_trait;
use thiserror::Error;

use crate::checksum::Md5Digest;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Target disconnected")]
    Disconnected,

    #[error("Erase failed: {0}")]
    EraseFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Read-back mismatch at offset {offset:#x}")]
    VerifyMismatch { offset: usize },

    #[error("Reset line error: {0}")]
    Reset(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Health token returned by a liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkHealth {
    /// Target answered and is idle.
    Ready,
    /// Target answered but reported it is busy.
    Busy,
    /// Nothing meaningful came back.
    Silent,
}

impl LinkHealth {
    pub fn is_responsive(&self) -> bool {
        !matches!(self, LinkHealth::Silent)
    }
}

/// Abstract flash transport.
///
/// Calls are suspend points; the caller applies its own timeout to each of
/// them, so implementations may simply await the hardware.
#[async_trait]
pub trait FlashTransport: Send + Sync {
    /// Erase enough of the memory to hold `length` bytes starting at 0.
    async fn erase(&self, length: usize) -> Result<(), TransportError>;

    /// Program `data` at `offset`. Offsets arrive strictly increasing.
    async fn write_chunk(&self, offset: usize, data: &[u8]) -> Result<(), TransportError>;

    /// Liveness probe.
    async fn read_status(&self) -> Result<LinkHealth, TransportError>;

    /// Digest of the first `length` bytes as held by the target, if the
    /// target can report one.
    async fn read_digest(&self, _length: usize) -> Result<Option<Md5Digest>, TransportError> {
        Ok(None)
    }
}

/// Hardware reset line of the target.
pub trait ResetLine: Send + Sync {
    fn assert_reset(&self) -> Result<(), TransportError>;
    fn release_reset(&self) -> Result<(), TransportError>;
}
