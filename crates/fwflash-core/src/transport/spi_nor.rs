//! JEDEC SPI NOR flash driven over a raw SPI bus.
//!
//! Erase works on 4 KiB sectors and programming on 256-byte pages. Every
//! programmed page is read back; a mismatching page is programmed once more
//! before the write is reported as failed.

use std::time::Duration;

use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::traits::{FlashTransport, LinkHealth, TransportError};
use crate::checksum::{Md5Digest, digest_of};

pub const PAGE_SIZE: usize = 256;
pub const SECTOR_SIZE: usize = 4096;

/// Highest address reachable with 3-byte addressing, plus one.
const ADDRESS_SPACE: usize = 1 << 24;

/// Standard SPI NOR opcodes.
pub mod opcodes {
    /// Write Enable, required before program and erase
    pub const WREN: u8 = 0x06;
    /// Write Disable
    pub const WRDI: u8 = 0x04;
    /// Read Status Register 1
    pub const RDSR: u8 = 0x05;
    /// 4 KiB Sector Erase
    pub const SE: u8 = 0x20;
    /// Page Program
    pub const PP: u8 = 0x02;
    /// Fast Read, one dummy byte after the address
    pub const FAST_READ: u8 = 0x0B;
    /// Read JEDEC ID
    pub const RDID: u8 = 0x9F;

    /// Write In Progress
    pub const SR_WIP: u8 = 0x01;
    /// Write Enable Latch
    pub const SR_WEL: u8 = 0x02;
}

/// One chip-select framed SPI exchange.
#[async_trait]
pub trait SpiBus: Send + Sync {
    /// Clock out `tx`, then clock in `rx_len` bytes.
    async fn transfer(&self, tx: &[u8], rx_len: usize) -> Result<Vec<u8>, TransportError>;
}

#[derive(Debug, Clone, Copy)]
pub struct NorTimings {
    pub poll_interval: Duration,
    pub sector_erase: Duration,
    pub page_program: Duration,
}

impl Default for NorTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_micros(100),
            sector_erase: Duration::from_millis(200),
            page_program: Duration::from_millis(15),
        }
    }
}

pub struct SpiNorFlash<B> {
    bus: B,
    timings: NorTimings,
}

impl<B: SpiBus> SpiNorFlash<B> {
    pub fn new(bus: B) -> Self {
        Self::with_timings(bus, NorTimings::default())
    }

    pub fn with_timings(bus: B, timings: NorTimings) -> Self {
        Self { bus, timings }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    fn command(opcode: u8, addr: usize) -> [u8; 4] {
        let mut frame = [opcode, 0, 0, 0];
        BigEndian::write_u24(&mut frame[1..], addr as u32);
        frame
    }

    fn check_range(addr: usize, len: usize) -> Result<(), TransportError> {
        if addr + len > ADDRESS_SPACE {
            return Err(TransportError::WriteFailed(format!(
                "{len} bytes at {addr:#x} exceed 3-byte address space"
            )));
        }
        Ok(())
    }

    /// Manufacturer and device id.
    pub async fn read_jedec_id(&self) -> Result<[u8; 3], TransportError> {
        let rx = self.bus.transfer(&[opcodes::RDID], 3).await?;
        let mut id = [0u8; 3];
        if rx.len() != id.len() {
            return Err(TransportError::ReadFailed(format!(
                "short JEDEC id ({} bytes)",
                rx.len()
            )));
        }
        id.copy_from_slice(&rx);
        Ok(id)
    }

    async fn read_status_register(&self) -> Result<u8, TransportError> {
        let rx = self.bus.transfer(&[opcodes::RDSR], 1).await?;
        rx.first()
            .copied()
            .ok_or_else(|| TransportError::ReadFailed("empty status register".into()))
    }

    async fn write_enable(&self) -> Result<(), TransportError> {
        self.bus.transfer(&[opcodes::WREN], 0).await?;
        let status = self.read_status_register().await?;
        if status & opcodes::SR_WEL == 0 {
            return Err(TransportError::WriteFailed(
                "write enable latch did not set".into(),
            ));
        }
        Ok(())
    }

    async fn write_disable(&self) -> Result<(), TransportError> {
        self.bus.transfer(&[opcodes::WRDI], 0).await?;
        Ok(())
    }

    async fn wait_ready(&self, limit: Duration) -> Result<(), TransportError> {
        let deadline = Instant::now() + limit;
        loop {
            if self.read_status_register().await? & opcodes::SR_WIP == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                });
            }
            tokio::time::sleep(self.timings.poll_interval).await;
        }
    }

    pub async fn read(&self, addr: usize, len: usize) -> Result<Vec<u8>, TransportError> {
        let cmd = Self::command(opcodes::FAST_READ, addr);
        let frame = [cmd[0], cmd[1], cmd[2], cmd[3], 0x00];
        let rx = self.bus.transfer(&frame, len).await?;
        if rx.len() != len {
            return Err(TransportError::ReadFailed(format!(
                "short read at {addr:#x}: {} of {len} bytes",
                rx.len()
            )));
        }
        Ok(rx)
    }

    async fn erase_sector(&self, sector: usize) -> Result<(), TransportError> {
        self.write_enable()
            .await
            .map_err(|e| TransportError::EraseFailed(e.to_string()))?;
        self.bus
            .transfer(&Self::command(opcodes::SE, sector * SECTOR_SIZE), 0)
            .await?;
        self.wait_ready(self.timings.sector_erase).await?;
        self.write_disable().await
    }

    async fn program_page(&self, addr: usize, data: &[u8]) -> Result<(), TransportError> {
        self.write_enable().await?;
        let mut frame = Vec::with_capacity(4 + data.len());
        frame.extend_from_slice(&Self::command(opcodes::PP, addr));
        frame.extend_from_slice(data);
        self.bus.transfer(&frame, 0).await?;
        self.wait_ready(self.timings.page_program).await?;
        self.write_disable().await
    }

    /// Program a page-contained span and confirm it by reading it back.
    async fn program_verified(&self, addr: usize, data: &[u8]) -> Result<(), TransportError> {
        for pass in 0..2 {
            self.program_page(addr, data).await?;
            if self.read(addr, data.len()).await? == data {
                return Ok(());
            }
            if pass == 0 {
                warn!(addr, "Page read-back mismatch, rewriting");
            }
        }
        Err(TransportError::VerifyMismatch { offset: addr })
    }
}

#[async_trait]
impl<B: SpiBus> FlashTransport for SpiNorFlash<B> {
    async fn erase(&self, length: usize) -> Result<(), TransportError> {
        Self::check_range(0, length)?;
        let sectors = length.div_ceil(SECTOR_SIZE);
        debug!(sectors, "Erasing sectors");
        for sector in 0..sectors {
            self.erase_sector(sector).await?;
        }
        Ok(())
    }

    async fn write_chunk(&self, offset: usize, data: &[u8]) -> Result<(), TransportError> {
        Self::check_range(offset, data.len())?;
        let mut pos = 0;
        while pos < data.len() {
            let addr = offset + pos;
            let room = PAGE_SIZE - addr % PAGE_SIZE;
            let n = room.min(data.len() - pos);
            self.program_verified(addr, &data[pos..pos + n]).await?;
            pos += n;
        }
        trace!(offset, len = data.len(), "Chunk programmed");
        Ok(())
    }

    async fn read_status(&self) -> Result<LinkHealth, TransportError> {
        let id = self.read_jedec_id().await?;
        if id.iter().all(|b| *b == 0x00) || id.iter().all(|b| *b == 0xFF) {
            return Ok(LinkHealth::Silent);
        }
        let status = self.read_status_register().await?;
        Ok(if status & opcodes::SR_WIP != 0 {
            LinkHealth::Busy
        } else {
            LinkHealth::Ready
        })
    }

    async fn read_digest(&self, length: usize) -> Result<Option<Md5Digest>, TransportError> {
        let mut held = Vec::with_capacity(length);
        let mut addr = 0;
        while addr < length {
            let n = SECTOR_SIZE.min(length - addr);
            held.extend_from_slice(&self.read(addr, n).await?);
            addr += n;
        }
        Ok(Some(digest_of(&held)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, PoisonError};

    const CHIP_SIZE: usize = 64 * 1024;

    /// Minimal NOR chip model: programming can only clear bits.
    struct SimChip {
        mem: Vec<u8>,
        wel: bool,
        silent: bool,
        /// Page programs to silently drop.
        dropped_programs: u32,
        /// Address whose cell always reads 0x00.
        dead_cell: Option<usize>,
        programs: usize,
    }

    struct SimBus(Mutex<SimChip>);

    impl SimBus {
        fn new() -> Self {
            Self(Mutex::new(SimChip {
                mem: vec![0x5A; CHIP_SIZE],
                wel: false,
                silent: false,
                dropped_programs: 0,
                dead_cell: None,
                programs: 0,
            }))
        }

        fn with<R>(&self, f: impl FnOnce(&mut SimChip) -> R) -> R {
            f(&mut self.0.lock().unwrap_or_else(PoisonError::into_inner))
        }
    }

    #[async_trait]
    impl SpiBus for SimBus {
        async fn transfer(&self, tx: &[u8], rx_len: usize) -> Result<Vec<u8>, TransportError> {
            self.with(|chip| {
                let addr = || BigEndian::read_u24(&tx[1..4]) as usize;
                let rx = match tx[0] {
                    _ if chip.silent => vec![0x00; rx_len],
                    opcodes::WREN => {
                        chip.wel = true;
                        Vec::new()
                    }
                    opcodes::WRDI => {
                        chip.wel = false;
                        Vec::new()
                    }
                    opcodes::RDSR => vec![if chip.wel { opcodes::SR_WEL } else { 0 }],
                    opcodes::RDID => vec![0xEF, 0x40, 0x18],
                    opcodes::SE if chip.wel => {
                        let start = addr();
                        chip.mem[start..start + SECTOR_SIZE].fill(0xFF);
                        chip.wel = false;
                        Vec::new()
                    }
                    opcodes::PP if chip.wel => {
                        chip.wel = false;
                        chip.programs += 1;
                        if chip.dropped_programs > 0 {
                            chip.dropped_programs -= 1;
                        } else {
                            let start = addr();
                            for (i, b) in tx[4..].iter().enumerate() {
                                chip.mem[start + i] &= *b;
                            }
                        }
                        Vec::new()
                    }
                    opcodes::FAST_READ => {
                        let start = addr();
                        let mut out = chip.mem[start..start + rx_len].to_vec();
                        if let Some(dead) = chip.dead_cell {
                            if (start..start + rx_len).contains(&dead) {
                                out[dead - start] = 0x00;
                            }
                        }
                        out
                    }
                    _ => Vec::new(),
                };
                Ok(rx)
            })
        }
    }

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[tokio::test]
    async fn test_erase_then_program_across_pages() {
        let flash = SpiNorFlash::new(SimBus::new());
        let data = image(600);

        flash.erase(data.len()).await.unwrap();
        flash.write_chunk(0, &data[..300]).await.unwrap();
        flash.write_chunk(300, &data[300..]).await.unwrap();

        assert_eq!(flash.read(0, data.len()).await.unwrap(), data);
        // 0..256, 256..300, 300..512, 512..600
        assert_eq!(flash.bus().with(|c| c.programs), 4);
        // Rest of the sector is erased.
        assert!(flash.read(600, SECTOR_SIZE - 600).await.unwrap().iter().all(|b| *b == 0xFF));
    }

    #[tokio::test]
    async fn test_dropped_program_is_rewritten_once() {
        let flash = SpiNorFlash::new(SimBus::new());
        flash.bus().with(|c| c.dropped_programs = 1);

        flash.erase(PAGE_SIZE).await.unwrap();
        flash.write_chunk(0, &image(PAGE_SIZE)).await.unwrap();
        assert_eq!(flash.bus().with(|c| c.programs), 2);
    }

    #[tokio::test]
    async fn test_persistent_mismatch_fails() {
        let flash = SpiNorFlash::new(SimBus::new());
        flash.bus().with(|c| c.dead_cell = Some(10));

        flash.erase(PAGE_SIZE).await.unwrap();
        let err = flash.write_chunk(0, &image(PAGE_SIZE)).await.unwrap_err();
        assert!(matches!(err, TransportError::VerifyMismatch { offset: 0 }));
    }

    #[tokio::test]
    async fn test_health_from_jedec_id() {
        let flash = SpiNorFlash::new(SimBus::new());
        assert_eq!(flash.read_status().await.unwrap(), LinkHealth::Ready);
        flash.bus().with(|c| c.silent = true);
        assert_eq!(flash.read_status().await.unwrap(), LinkHealth::Silent);
    }

    #[tokio::test]
    async fn test_digest_reads_back_image() {
        let flash = SpiNorFlash::new(SimBus::new());
        let data = image(5000);
        flash.erase(data.len()).await.unwrap();
        flash.write_chunk(0, &data).await.unwrap();

        let digest = flash.read_digest(data.len()).await.unwrap().unwrap();
        assert_eq!(digest, digest_of(&data));
    }

    #[tokio::test]
    async fn test_address_space_is_bounded() {
        let flash = SpiNorFlash::new(SimBus::new());
        assert!(flash.write_chunk(ADDRESS_SPACE - 1, b"ab").await.is_err());
    }

    #[test]
    fn test_command_encodes_big_endian_address() {
        let frame = SpiNorFlash::<SimBus>::command(opcodes::SE, 0x012345);
        assert_eq!(frame, [0x20, 0x01, 0x23, 0x45]);
    }
}
