//! Image source resolution: descriptor in, complete byte source out.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use super::descriptor::{ImageDescriptor, ImageSource};
use super::download::Downloader;
use crate::error::FlashError;

/// Number of hex characters of the URL hash used as cache file name.
pub const CACHE_KEY_LEN: usize = 8;

/// Complete image bytes plus declared length. Not yet verified.
#[derive(Debug, Clone)]
pub struct ResolvedImage {
    pub bytes: Bytes,
    pub length: usize,
}

impl ResolvedImage {
    fn new(bytes: Bytes) -> Self {
        let length = bytes.len();
        Self { bytes, length }
    }
}

/// Cache key of a remote image: a hash of the URL string, not the content.
pub fn cache_key(url: &str) -> String {
    let digest = hex::encode(Sha256::digest(url.as_bytes()));
    digest[..CACHE_KEY_LEN].to_string()
}

pub struct ImageResolver {
    cache_dir: PathBuf,
    downloader: Arc<dyn Downloader>,
}

impl ImageResolver {
    pub fn new(cache_dir: impl Into<PathBuf>, downloader: Arc<dyn Downloader>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            downloader,
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Deterministic local path for a remote image.
    pub fn cache_path(&self, url: &str) -> PathBuf {
        self.cache_dir.join(cache_key(url))
    }

    #[instrument(skip(self), fields(source = %descriptor.source))]
    pub async fn resolve(&self, descriptor: &ImageDescriptor) -> Result<ResolvedImage, FlashError> {
        match &descriptor.source {
            ImageSource::Local(path) => self.resolve_local(path).await,
            ImageSource::Remote(url) => self.resolve_remote(url).await,
            ImageSource::Embedded(image) => {
                debug!(length = image.length(), "Using embedded image");
                Ok(ResolvedImage::new(Bytes::from_static(image.data)))
            }
        }
    }

    async fn resolve_local(&self, path: &Path) -> Result<ResolvedImage, FlashError> {
        match tokio::fs::read(path).await {
            Ok(data) => {
                debug!(path = %path.display(), length = data.len(), "Loaded local image");
                Ok(ResolvedImage::new(Bytes::from(data)))
            }
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Could not read image");
                }
                Err(FlashError::SourceNotFound {
                    path: path.to_path_buf(),
                })
            }
        }
    }

    async fn resolve_remote(&self, url: &str) -> Result<ResolvedImage, FlashError> {
        let local = self.cache_path(url);
        let failed = |message: String| FlashError::DownloadFailed {
            url: url.to_string(),
            message,
        };

        if !exists(&local).await {
            info!(url = %url, cache = %local.display(), "Image not cached, fetching");
            tokio::fs::create_dir_all(&self.cache_dir)
                .await
                .map_err(|e| failed(e.to_string()))?;
            self.downloader
                .download(url, &local)
                .await
                .map_err(|e| failed(e.to_string()))?;
            if !exists(&local).await {
                return Err(failed(format!(
                    "{} missing after download",
                    local.display()
                )));
            }
        } else {
            debug!(cache = %local.display(), "Using cached image");
        }

        let data = tokio::fs::read(&local)
            .await
            .map_err(|e| failed(e.to_string()))?;
        Ok(ResolvedImage::new(Bytes::from(data)))
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::download::{DownloadError, NoDownloader};
    use crate::image::EmbeddedImage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves a fixed body, optionally "forgetting" to write it.
    struct FixedDownloader {
        body: Vec<u8>,
        write: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Downloader for FixedDownloader {
        async fn download(&self, _url: &str, dest: &Path) -> Result<(), DownloadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.write {
                tokio::fs::write(dest, &self.body).await?;
            }
            Ok(())
        }
    }

    #[test]
    fn test_cache_key_is_url_hash_prefix() {
        // sha256("abc") = ba7816bf...
        assert_eq!(cache_key("abc"), "ba7816bf");
        assert_eq!(cache_key("https://a/fw.bin").len(), CACHE_KEY_LEN);
        assert_ne!(cache_key("https://a/fw.bin"), cache_key("https://a/fw2.bin"));
    }

    #[tokio::test]
    async fn test_local_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ImageResolver::new(dir.path(), Arc::new(NoDownloader));
        let err = resolver
            .resolve(&ImageDescriptor::local(dir.path().join("image.bin")))
            .await
            .unwrap_err();
        assert!(matches!(err, FlashError::SourceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_local_reads_complete_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.bin");
        std::fs::write(&path, [0xAAu8; 16]).unwrap();

        let resolver = ImageResolver::new(dir.path(), Arc::new(NoDownloader));
        let img = resolver.resolve(&ImageDescriptor::local(&path)).await.unwrap();
        assert_eq!(img.length, 16);
        assert_eq!(&img.bytes[..], &[0xAAu8; 16]);
    }

    #[tokio::test]
    async fn test_remote_downloads_once_then_uses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Arc::new(FixedDownloader {
            body: b"remote image".to_vec(),
            write: true,
            calls: AtomicUsize::new(0),
        });
        let resolver = ImageResolver::new(dir.path().join("cache"), downloader.clone());
        let desc = ImageDescriptor::remote("https://example.com/fw.bin");

        let first = resolver.resolve(&desc).await.unwrap();
        let second = resolver.resolve(&desc).await.unwrap();
        assert_eq!(&first.bytes[..], b"remote image");
        assert_eq!(first.bytes, second.bytes);
        assert_eq!(downloader.calls.load(Ordering::SeqCst), 1);
        assert!(resolver.cache_path("https://example.com/fw.bin").exists());
    }

    #[tokio::test]
    async fn test_remote_absent_after_fetch_is_download_failed() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Arc::new(FixedDownloader {
            body: Vec::new(),
            write: false,
            calls: AtomicUsize::new(0),
        });
        let resolver = ImageResolver::new(dir.path(), downloader);
        let err = resolver
            .resolve(&ImageDescriptor::remote("https://example.com/fw.bin"))
            .await
            .unwrap_err();
        assert!(matches!(err, FlashError::DownloadFailed { .. }));
    }

    #[tokio::test]
    async fn test_remote_fetch_error_is_download_failed() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ImageResolver::new(dir.path(), Arc::new(NoDownloader));
        let err = resolver
            .resolve(&ImageDescriptor::remote("https://example.com/fw.bin"))
            .await
            .unwrap_err();
        assert!(matches!(err, FlashError::DownloadFailed { .. }));
    }

    #[tokio::test]
    async fn test_embedded_always_resolves() {
        static DATA: [u8; 3] = [9, 8, 7];
        let dir = tempfile::tempdir().unwrap();
        let resolver = ImageResolver::new(dir.path(), Arc::new(NoDownloader));
        let embedded = EmbeddedImage::new(&DATA, "00000000000000000000000000000000", None);
        let img = resolver
            .resolve(&ImageDescriptor::embedded(embedded))
            .await
            .unwrap();
        assert_eq!(img.length, embedded.length());
        assert_eq!(img.length, 3);
        assert_eq!(&img.bytes[..], &DATA);
    }
}
