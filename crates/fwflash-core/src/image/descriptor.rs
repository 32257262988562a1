//! Image descriptors: where an image comes from, before anything is trusted.

use std::fmt;
use std::path::PathBuf;

use tracing::warn;

use super::version::ImageVersion;

/// An image baked into the binary at build time.
///
/// Data, length, version tag and digest are the whole packaging contract.
/// The length is taken from the data and cannot be set separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddedImage {
    pub data: &'static [u8],
    length: usize,
    pub version: Option<&'static str>,
    pub md5: &'static str,
    /// File the data was embedded from, when known.
    pub name: Option<&'static str>,
}

impl EmbeddedImage {
    pub const fn new(data: &'static [u8], md5: &'static str, version: Option<&'static str>) -> Self {
        Self {
            data,
            length: data.len(),
            version,
            md5,
            name: None,
        }
    }

    pub const fn length(&self) -> usize {
        self.length
    }

    pub const fn with_name(mut self, name: &'static str) -> Self {
        self.name = Some(name);
        self
    }

    /// Embedded images serve as the factory fallback and are expected to be
    /// packaged from a file named accordingly.
    pub fn looks_like_factory(&self) -> bool {
        self.name
            .map(|n| n.to_ascii_lowercase().contains("factory"))
            .unwrap_or(true)
    }
}

/// Embed an image file together with its precomputed digest.
///
/// ```ignore
/// static FACTORY: EmbeddedImage =
///     embed_image!("../firmware/factory.bin", "0123456789abcdef0123456789abcdef", "v1.0.0");
/// ```
#[macro_export]
macro_rules! embed_image {
    ($path:expr, $md5:expr) => {
        $crate::image::EmbeddedImage::new(include_bytes!($path), $md5, None).with_name($path)
    };
    ($path:expr, $md5:expr, $version:expr) => {
        $crate::image::EmbeddedImage::new(include_bytes!($path), $md5, Some($version))
            .with_name($path)
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Local(PathBuf),
    Remote(String),
    Embedded(EmbeddedImage),
}

impl ImageSource {
    /// `http://` and `https://` locations are remote, anything else is a path.
    pub fn parse_shorthand(value: &str) -> Self {
        if value.starts_with("http://") || value.starts_with("https://") {
            ImageSource::Remote(value.to_string())
        } else {
            ImageSource::Local(PathBuf::from(value))
        }
    }
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::Local(path) => write!(f, "{}", path.display()),
            ImageSource::Remote(url) => write!(f, "{}", url),
            ImageSource::Embedded(img) => write!(f, "<embedded {} bytes>", img.length()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub source: ImageSource,
    pub version: Option<ImageVersion>,
}

impl ImageDescriptor {
    pub fn new(source: ImageSource) -> Self {
        Self {
            source,
            version: None,
        }
    }

    pub fn with_version(mut self, version: ImageVersion) -> Self {
        self.version = Some(version);
        self
    }

    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self::new(ImageSource::Local(path.into()))
    }

    pub fn remote(url: impl Into<String>) -> Self {
        Self::new(ImageSource::Remote(url.into()))
    }

    pub fn embedded(image: EmbeddedImage) -> Self {
        let version = image.version.and_then(|tag| match ImageVersion::parse(tag) {
            Ok(version) => Some(version),
            Err(e) => {
                warn!(tag, error = %e, "Ignoring malformed embedded image version");
                None
            }
        });
        Self {
            source: ImageSource::Embedded(image),
            version,
        }
    }
}

impl fmt::Display for ImageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{} ({})", self.source, v),
            None => write!(f, "{}", self.source),
        }
    }
}
