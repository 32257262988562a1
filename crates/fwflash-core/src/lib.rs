//! fwflash-core: firmware image flashing orchestrator.
//!
//! Acquires a firmware image, verifies it against an MD5 digest and writes
//! it to a target's non-volatile memory over a narrow, possibly unreliable
//! transport, reporting progress as discrete events.
//!
//! # Architecture
//!
//! - **Image**: descriptors, version tags, download and cache resolution
//! - **Checksum**: digest parsing, side-file resolution, verification
//! - **Transport**: target abstraction (SPI NOR, file-backed, mock)
//! - **Link**: per-target link state machine and flash lease
//! - **Transfer**: erase, chunked writes with retries, read-back check
//! - **Events**: observer fan-out and automation triggers
//! - **Flasher**: high-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fwflash_core::{EventDispatcher, FileFlash, Flasher, FlasherConfig, HttpDownloader};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = FlasherConfig::load_from_file("fwflash.toml")?;
//! let events = EventDispatcher::spawn();
//! let flasher = Flasher::from_config(
//!     &config,
//!     Arc::new(FileFlash::new("flash.bin")),
//!     Arc::new(HttpDownloader::default()),
//!     events,
//! );
//! if let Some(image) = &config.image {
//!     flasher.flash(&image.to_request()?).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod checksum;
pub mod config;
pub mod error;
pub mod events;
pub mod flasher;
pub mod image;
pub mod link;
pub mod transfer;
pub mod transport;

// Re-exports for convenience
pub use checksum::{ChecksumResolver, ChecksumSpec, Md5Digest, digest_of, verify};
pub use config::{ConfigError, FlasherConfig, ImageConfig};
pub use error::{FailureReason, FlashError};
pub use events::{
    EventDispatcher, FlashEvent, FlashObserver, LinkEvent, NullObserver, PhaseEvent,
    RecordingObserver, TracingObserver, Trigger, TriggerKind,
};
pub use flasher::{FlashRequest, Flasher, FlasherStatus};
pub use image::{
    EmbeddedImage, HttpDownloader, ImageDescriptor, ImageResolver, ImageSource, ImageVersion,
};
pub use link::{LinkMonitor, LinkSettings, LinkState};
pub use transfer::{CancelToken, FlashJob, JobReport, JobState, TransferEngine, TransferSettings};
pub use transport::{FileFlash, FlashTransport, LinkHealth, MockTransport, TransportError};
