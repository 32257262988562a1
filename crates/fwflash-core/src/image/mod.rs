//! Image acquisition: descriptors, version tags, download, resolution.

pub mod descriptor;
pub mod download;
pub mod resolver;
pub mod version;

pub use descriptor::{EmbeddedImage, ImageDescriptor, ImageSource};
pub use download::{DownloadError, Downloader, HttpDownloader, NoDownloader};
pub use resolver::{ImageResolver, ResolvedImage, cache_key};
pub use version::{ImageVersion, PreRelease, VersionParseError};
