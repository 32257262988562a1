//! Remote image fetching.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Downloads are not available: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fetches a URL into a local file.
///
/// On success the complete body must exist at `dest`; implementations never
/// leave a partial file there.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, url: &str, dest: &Path) -> Result<(), DownloadError>;
}

/// `reqwest`-backed downloader.
pub struct HttpDownloader {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpDownloader {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

impl Default for HttpDownloader {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    #[instrument(skip(self), fields(dest = %dest.display()))]
    async fn download(&self, url: &str, dest: &Path) -> Result<(), DownloadError> {
        info!(url = %url, "Downloading image");
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?;
        let body = response.bytes().await?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write next to the destination, then rename, so the cache never
        // holds a truncated body.
        let partial = dest.with_extension("part");
        tokio::fs::write(&partial, &body).await?;
        tokio::fs::rename(&partial, dest).await?;

        debug!(bytes = body.len(), "Download complete");
        Ok(())
    }
}

/// Downloader for setups without network access; every fetch fails.
pub struct NoDownloader;

#[async_trait]
impl Downloader for NoDownloader {
    async fn download(&self, url: &str, _dest: &Path) -> Result<(), DownloadError> {
        Err(DownloadError::Unavailable(url.to_string()))
    }
}
