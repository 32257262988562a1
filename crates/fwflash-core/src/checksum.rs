//! Image digests: parsing, resolution from side files, verification.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use md5::{Digest, Md5};
use tracing::{debug, instrument, warn};

use crate::error::FlashError;
use crate::image::{ImageDescriptor, ImageResolver, ImageSource};

/// Length of an MD5 digest in hex characters.
pub const MD5_HEX_LEN: usize = 32;

/// A syntactically valid MD5 digest, stored lower-case.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Md5Digest(String);

impl Md5Digest {
    /// Accepts exactly 32 hex digits in any case.
    pub fn parse(value: &str) -> Result<Self, FlashError> {
        if is_valid_md5(value) {
            Ok(Self(value.to_ascii_lowercase()))
        } else {
            Err(FlashError::MalformedChecksum {
                value: value.to_string(),
            })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Md5Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Md5Digest {
    type Err = FlashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

pub fn is_valid_md5(value: &str) -> bool {
    value.len() == MD5_HEX_LEN && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// MD5 of `bytes`.
pub fn digest_of(bytes: &[u8]) -> Md5Digest {
    Md5Digest(hex::encode(Md5::digest(bytes)))
}

/// True when `bytes` hash to `expected`.
pub fn verify(bytes: &[u8], expected: &Md5Digest) -> bool {
    digest_of(bytes).0.eq_ignore_ascii_case(&expected.0)
}

/// Like [`verify`] but reports the mismatch as an error.
pub fn ensure_matches(bytes: &[u8], expected: &Md5Digest) -> Result<(), FlashError> {
    let computed = digest_of(bytes);
    if computed.0.eq_ignore_ascii_case(&expected.0) {
        debug!(md5 = %computed, "Image digest matches");
        Ok(())
    } else {
        warn!(expected = %expected, computed = %computed, "Image digest mismatch");
        Err(FlashError::ChecksumMismatch {
            expected: expected.to_string(),
            computed: computed.to_string(),
        })
    }
}

/// Where the expected digest comes from. Exactly one source by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksumSpec {
    Literal(String),
    File(PathBuf),
    Url(String),
}

impl fmt::Display for ChecksumSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumSpec::Literal(s) => write!(f, "md5 {}", s),
            ChecksumSpec::File(p) => write!(f, "md5 file {}", p.display()),
            ChecksumSpec::Url(u) => write!(f, "md5 url {}", u),
        }
    }
}

/// Turns a [`ChecksumSpec`] into a validated digest, fetching side files
/// through the image resolver.
pub struct ChecksumResolver {
    images: Arc<ImageResolver>,
}

impl ChecksumResolver {
    pub fn new(images: Arc<ImageResolver>) -> Self {
        Self { images }
    }

    #[instrument(skip(self), fields(source = %source))]
    pub async fn resolve_digest(&self, source: &ChecksumSpec) -> Result<Md5Digest, FlashError> {
        let side = match source {
            ChecksumSpec::Literal(value) => return Md5Digest::parse(value),
            ChecksumSpec::File(path) => ImageDescriptor::new(ImageSource::Local(path.clone())),
            ChecksumSpec::Url(url) => ImageDescriptor::new(ImageSource::Remote(url.clone())),
        };

        let resolved = self.images.resolve(&side).await?;
        let text = String::from_utf8_lossy(&resolved.bytes);
        let first_line = text.lines().next().unwrap_or("").trim();
        Md5Digest::parse(first_line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::NoDownloader;

    const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

    #[test]
    fn test_accepts_any_case_hex() {
        let upper = EMPTY_MD5.to_ascii_uppercase();
        assert!(Md5Digest::parse(EMPTY_MD5).is_ok());
        let digest = Md5Digest::parse(&upper).unwrap();
        assert_eq!(digest.as_str(), EMPTY_MD5);

        let hex_chars = b"0123456789abcdefABCDEF";
        for start in 0..hex_chars.len() {
            let candidate: String = (0..MD5_HEX_LEN)
                .map(|i| hex_chars[(start + i * 7) % hex_chars.len()] as char)
                .collect();
            assert!(is_valid_md5(&candidate), "{candidate}");
        }
    }

    #[test]
    fn test_rejects_non_digests() {
        let non_ascii = format!("é{}", &EMPTY_MD5[2..]);
        let too_long = format!("{EMPTY_MD5}0");
        let rejects: [&str; 8] = [
            "",
            &EMPTY_MD5[..31],
            &too_long,
            "g41d8cd98f00b204e9800998ecf8427e",
            " d41d8cd98f00b204e9800998ecf8427",
            "d41d8cd98f00b204e9800998ecf8427e\n",
            "d41d8cd9-f00b-204e-9800-998ecf8427e",
            &non_ascii,
        ];
        for value in rejects {
            let err = Md5Digest::parse(value).unwrap_err();
            assert!(matches!(err, FlashError::MalformedChecksum { .. }), "{value:?}");
        }
    }

    #[test]
    fn test_verify_detects_any_change() {
        let image = b"firmware image contents".to_vec();
        let digest = digest_of(&image);
        assert!(verify(&image, &digest));

        for i in 0..image.len() {
            let mut altered = image.clone();
            altered[i] ^= 0x01;
            assert!(!verify(&image, &digest_of(&altered)));
        }
        assert!(!verify(&image, &digest_of(&image[..image.len() - 1])));
    }

    #[test]
    fn test_known_digest() {
        assert_eq!(digest_of(b"").as_str(), EMPTY_MD5);
        let upper = Md5Digest::parse(&EMPTY_MD5.to_ascii_uppercase()).unwrap();
        assert!(verify(b"", &upper));
        assert!(ensure_matches(b"x", &upper).is_err());
    }

    #[tokio::test]
    async fn test_resolve_from_side_file() {
        let dir = tempfile::tempdir().unwrap();
        let side = dir.path().join("image.bin.md5");
        std::fs::write(&side, format!("  {}  \nimage.bin\n", EMPTY_MD5.to_ascii_uppercase()))
            .unwrap();

        let images = Arc::new(ImageResolver::new(dir.path(), Arc::new(NoDownloader)));
        let resolver = ChecksumResolver::new(images);

        let digest = resolver
            .resolve_digest(&ChecksumSpec::File(side))
            .await
            .unwrap();
        assert_eq!(digest.as_str(), EMPTY_MD5);
    }

    #[tokio::test]
    async fn test_side_file_with_garbage_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let side = dir.path().join("bad.md5");
        std::fs::write(&side, "not a digest\n").unwrap();

        let images = Arc::new(ImageResolver::new(dir.path(), Arc::new(NoDownloader)));
        let resolver = ChecksumResolver::new(images);

        let err = resolver
            .resolve_digest(&ChecksumSpec::File(side))
            .await
            .unwrap_err();
        assert!(matches!(err, FlashError::MalformedChecksum { .. }));

        let err = resolver
            .resolve_digest(&ChecksumSpec::File(dir.path().join("missing.md5")))
            .await
            .unwrap_err();
        assert!(matches!(err, FlashError::SourceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_literal_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        let images = Arc::new(ImageResolver::new(dir.path(), Arc::new(NoDownloader)));
        let resolver = ChecksumResolver::new(images);

        assert!(
            resolver
                .resolve_digest(&ChecksumSpec::Literal("abc".into()))
                .await
                .is_err()
        );
        assert_eq!(
            resolver
                .resolve_digest(&ChecksumSpec::Literal(EMPTY_MD5.into()))
                .await
                .unwrap()
                .as_str(),
            EMPTY_MD5
        );
    }
}
