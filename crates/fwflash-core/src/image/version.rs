//! Semantic image version tags.
//!
//! Accepted form: `v?MAJOR.MINOR.PATCH(-(alpha|beta|rc|dev)(.N)?)?`,
//! case-insensitive. Each numeric field must fit in a byte because the tag
//! is carried to the target as five bytes.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Not a valid version string: {0:?}")]
pub struct VersionParseError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PreRelease {
    Alpha,
    Beta,
    Rc,
    Dev,
}

impl PreRelease {
    /// Index used in the byte encoding; 0 means "no pre-release".
    fn index(&self) -> u8 {
        match self {
            PreRelease::Alpha => 1,
            PreRelease::Beta => 2,
            PreRelease::Rc => 3,
            PreRelease::Dev => 4,
        }
    }

    fn parse(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "alpha" => Some(PreRelease::Alpha),
            "beta" => Some(PreRelease::Beta),
            "rc" => Some(PreRelease::Rc),
            "dev" => Some(PreRelease::Dev),
            _ => None,
        }
    }
}

impl fmt::Display for PreRelease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreRelease::Alpha => write!(f, "alpha"),
            PreRelease::Beta => write!(f, "beta"),
            PreRelease::Rc => write!(f, "rc"),
            PreRelease::Dev => write!(f, "dev"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    pub pre: Option<(PreRelease, u8)>,
}

impl ImageVersion {
    pub fn parse(value: &str) -> Result<Self, VersionParseError> {
        let err = || VersionParseError(value.to_string());

        let body = value
            .strip_prefix('v')
            .or_else(|| value.strip_prefix('V'))
            .unwrap_or(value);
        let (core, pre) = match body.split_once('-') {
            Some((core, pre)) => (core, Some(pre)),
            None => (body, None),
        };

        let mut fields = core.split('.');
        let mut next_number = || -> Result<u8, VersionParseError> {
            let field = fields.next().ok_or_else(err)?;
            parse_number(field).ok_or_else(err)
        };
        let major = next_number()?;
        let minor = next_number()?;
        let patch = next_number()?;
        if fields.next().is_some() {
            return Err(err());
        }

        let pre = match pre {
            None => None,
            Some(pre) => {
                let (tag, counter) = match pre.split_once('.') {
                    Some((tag, counter)) => (tag, parse_number(counter).ok_or_else(err)?),
                    None => (pre, 0),
                };
                Some((PreRelease::parse(tag).ok_or_else(err)?, counter))
            }
        };

        Ok(Self {
            major,
            minor,
            patch,
            pre,
        })
    }

    /// `[major, minor, patch, pre_index, pre_counter]`.
    pub fn to_bytes(&self) -> [u8; 5] {
        let (pre_idx, pre_counter) = match self.pre {
            Some((tag, counter)) => (tag.index(), counter),
            None => (0, 0),
        };
        [self.major, self.minor, self.patch, pre_idx, pre_counter]
    }
}

fn parse_number(field: &str) -> Option<u8> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    field.parse().ok()
}

impl FromStr for ImageVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some((tag, counter)) = self.pre {
            write!(f, "-{}.{}", tag, counter)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_versions() {
        let v = ImageVersion::parse("1.2.3").unwrap();
        assert_eq!(v.to_bytes(), [1, 2, 3, 0, 0]);
        assert_eq!(ImageVersion::parse("v0.10.255").unwrap().to_bytes(), [0, 10, 255, 0, 0]);
        assert_eq!(ImageVersion::parse("V2.0.0").unwrap().major, 2);
    }

    #[test]
    fn test_pre_release_versions() {
        assert_eq!(
            ImageVersion::parse("v1.0.0-beta.3").unwrap().to_bytes(),
            [1, 0, 0, 2, 3]
        );
        assert_eq!(
            ImageVersion::parse("1.0.0-RC").unwrap().to_bytes(),
            [1, 0, 0, 3, 0]
        );
        assert_eq!(
            ImageVersion::parse("1.1.0-dev.12").unwrap().to_bytes(),
            [1, 1, 0, 4, 12]
        );
        assert_eq!(
            ImageVersion::parse("1.1.0-Alpha.1").unwrap().to_string(),
            "v1.1.0-alpha.1"
        );
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in [
            "", "1", "1.2", "1.2.3.4", "x1.2.3", "1.2.3-", "1.2.3-gamma", "1.2.3-rc.",
            "1.2.3-rc.x", "256.0.0", "1.-2.3", "1.2.3 ",
        ] {
            assert!(ImageVersion::parse(bad).is_err(), "{bad:?}");
        }
    }
}
