//! Transport layer module.

pub mod file;
pub mod mock;
pub mod spi_nor;
pub mod traits;

pub use file::FileFlash;
pub use mock::{ChunkGate, MockResetLine, MockTransport, TransportOp};
pub use spi_nor::{NorTimings, PAGE_SIZE, SECTOR_SIZE, SpiBus, SpiNorFlash};
pub use traits::{FlashTransport, LinkHealth, ResetLine, TransportError};
