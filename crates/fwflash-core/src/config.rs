//! Flasher configuration, loaded from TOML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::checksum::ChecksumSpec;
use crate::flasher::FlashRequest;
use crate::image::{ImageDescriptor, ImageSource, ImageVersion, VersionParseError};
use crate::link::LinkSettings;
use crate::transfer::TransferSettings;

/// Problems in the configuration itself, found before any job exists.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No checksum source given; set one of md5, md5_file, md5_url")]
    NoChecksumSource,

    #[error("Exactly one checksum source allowed, found {0}")]
    MultipleChecksumSources(String),

    #[error("Invalid image version: {0}")]
    InvalidVersion(#[from] VersionParseError),

    #[error("Invalid value for {field}: {reason}")]
    InvalidSetting { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub erase_attempts: u32,
    pub write_attempts: u32,
    pub erase_timeout_ms: u64,
    pub chunk_timeout_ms: u64,
    pub verify_after_write: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        let d = TransferSettings::default();
        Self {
            chunk_size: d.chunk_size,
            erase_attempts: d.erase_attempts,
            write_attempts: d.write_attempts,
            erase_timeout_ms: d.erase_timeout.as_millis() as u64,
            chunk_timeout_ms: d.chunk_timeout.as_millis() as u64,
            verify_after_write: d.verify_after_write,
        }
    }
}

impl TransferConfig {
    pub fn settings(&self) -> TransferSettings {
        TransferSettings {
            chunk_size: self.chunk_size,
            erase_attempts: self.erase_attempts,
            write_attempts: self.write_attempts,
            erase_timeout: Duration::from_millis(self.erase_timeout_ms),
            chunk_timeout: Duration::from_millis(self.chunk_timeout_ms),
            verify_after_write: self.verify_after_write,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub probe_timeout_ms: u64,
    pub probe_interval_ms: u64,
    pub unresponsive_after: u32,
    pub reset_pulse_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        let d = LinkSettings::default();
        Self {
            probe_timeout_ms: d.probe_timeout.as_millis() as u64,
            probe_interval_ms: 1000,
            unresponsive_after: d.unresponsive_after,
            reset_pulse_ms: 100,
        }
    }
}

impl LinkConfig {
    pub fn settings(&self) -> LinkSettings {
        LinkSettings {
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            unresponsive_after: self.unresponsive_after,
        }
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn reset_pulse(&self) -> Duration {
        Duration::from_millis(self.reset_pulse_ms)
    }
}

/// What to flash. `image_file` is a path or an `http(s)://` URL.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub image_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// This image is the factory fallback.
    #[serde(default)]
    pub factory: bool,
}

impl ImageConfig {
    pub fn checksum_spec(&self) -> Result<ChecksumSpec, ConfigError> {
        let mut given = Vec::new();
        if let Some(md5) = &self.md5 {
            given.push(("md5", ChecksumSpec::Literal(md5.clone())));
        }
        if let Some(path) = &self.md5_file {
            given.push(("md5_file", ChecksumSpec::File(path.clone())));
        }
        if let Some(url) = &self.md5_url {
            given.push(("md5_url", ChecksumSpec::Url(url.clone())));
        }

        match given.len() {
            0 => Err(ConfigError::NoChecksumSource),
            1 => Ok(given.remove(0).1),
            _ => Err(ConfigError::MultipleChecksumSources(
                given
                    .iter()
                    .map(|(name, _)| *name)
                    .collect::<Vec<_>>()
                    .join(", "),
            )),
        }
    }

    pub fn to_request(&self) -> Result<FlashRequest, ConfigError> {
        if self.image_file.trim().is_empty() {
            return Err(ConfigError::InvalidSetting {
                field: "image_file",
                reason: "must not be empty".into(),
            });
        }
        if self.factory && !self.image_file.to_ascii_lowercase().contains("factory") {
            warn!(image = %self.image_file, "Factory image file name does not contain 'factory'");
        }

        let mut image = ImageDescriptor::new(ImageSource::parse_shorthand(&self.image_file));
        if let Some(version) = &self.version {
            image = image.with_version(ImageVersion::parse(version)?);
        }
        Ok(FlashRequest::new(image, self.checksum_spec()?))
    }
}

/// Top-level configuration of a flasher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlasherConfig {
    /// Where downloaded images and digest files are cached.
    pub cache_dir: PathBuf,
    pub transfer: TransferConfig,
    pub link: LinkConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageConfig>,
}

impl Default for FlasherConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(".fwflash-cache"),
            transfer: TransferConfig::default(),
            link: LinkConfig::default(),
            image: None,
        }
    }
}

impl FlasherConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FlasherConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |field: &'static str, value: u64| {
            if value == 0 {
                Err(ConfigError::InvalidSetting {
                    field,
                    reason: "must be greater than zero".into(),
                })
            } else {
                Ok(())
            }
        };
        positive("transfer.chunk_size", self.transfer.chunk_size as u64)?;
        positive("transfer.erase_attempts", self.transfer.erase_attempts.into())?;
        positive("transfer.write_attempts", self.transfer.write_attempts.into())?;
        positive("transfer.erase_timeout_ms", self.transfer.erase_timeout_ms)?;
        positive("transfer.chunk_timeout_ms", self.transfer.chunk_timeout_ms)?;
        positive("link.probe_timeout_ms", self.link.probe_timeout_ms)?;
        positive("link.probe_interval_ms", self.link.probe_interval_ms)?;
        positive("link.unresponsive_after", self.link.unresponsive_after.into())?;
        if let Some(image) = &self.image {
            image.checksum_spec()?;
        }
        Ok(())
    }
}
