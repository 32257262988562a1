//! File-backed flash target.
//!
//! Emulates a NOR part in a regular file: erase sets whole sectors to 0xFF,
//! writes land at their offset. Useful for dry runs and for producing the
//! exact image a real part would hold.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, trace};

use super::spi_nor::SECTOR_SIZE;
use super::traits::{FlashTransport, LinkHealth, TransportError};
use crate::checksum::{Md5Digest, digest_of};

pub struct FileFlash {
    path: PathBuf,
}

impl FileFlash {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl FlashTransport for FileFlash {
    async fn erase(&self, length: usize) -> Result<(), TransportError> {
        let sectors = length.div_ceil(SECTOR_SIZE);
        let erased = vec![0xFFu8; sectors * SECTOR_SIZE];
        debug!(path = %self.path.display(), sectors, "Erasing file target");
        tokio::fs::write(&self.path, &erased)
            .await
            .map_err(|e| TransportError::EraseFailed(e.to_string()))
    }

    async fn write_chunk(&self, offset: usize, data: &[u8]) -> Result<(), TransportError> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        file.seek(SeekFrom::Start(offset as u64)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        trace!(offset, len = data.len(), "Wrote chunk");
        Ok(())
    }

    async fn read_status(&self) -> Result<LinkHealth, TransportError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        Ok(if tokio::fs::try_exists(dir).await.unwrap_or(false) {
            LinkHealth::Ready
        } else {
            LinkHealth::Silent
        })
    }

    async fn read_digest(&self, length: usize) -> Result<Option<Md5Digest>, TransportError> {
        let mut file = tokio::fs::File::open(&self.path)
            .await
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;
        let mut held = vec![0u8; length];
        file.read_exact(&mut held)
            .await
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;
        Ok(Some(digest_of(&held)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_erase_rounds_to_sectors() {
        let dir = tempfile::tempdir().unwrap();
        let target = FileFlash::new(dir.path().join("flash.bin"));

        target.erase(10).await.unwrap();
        let held = std::fs::read(target.path()).unwrap();
        assert_eq!(held.len(), SECTOR_SIZE);
        assert!(held.iter().all(|b| *b == 0xFF));
    }

    #[tokio::test]
    async fn test_write_then_digest() {
        let dir = tempfile::tempdir().unwrap();
        let target = FileFlash::new(dir.path().join("flash.bin"));
        let image = b"firmware payload";

        target.erase(image.len()).await.unwrap();
        target.write_chunk(0, &image[..8]).await.unwrap();
        target.write_chunk(8, &image[8..]).await.unwrap();

        let digest = target.read_digest(image.len()).await.unwrap().unwrap();
        assert_eq!(digest, digest_of(image));
        assert_eq!(target.read_status().await.unwrap(), LinkHealth::Ready);
    }

    #[tokio::test]
    async fn test_missing_directory_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let target = FileFlash::new(dir.path().join("gone").join("flash.bin"));
        assert_eq!(target.read_status().await.unwrap(), LinkHealth::Silent);
        assert!(target.write_chunk(0, b"x").await.is_err());
    }
}
