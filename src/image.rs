use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid platform {0:?}, expected <os>/<arch>")]
    InvalidPlatform(String),

    #[error("invalid digest {0:?}, expected <algorithm>:<hex>")]
    InvalidDigest(String),
}

/// Operating system and CPU architecture of a single image.
///
/// Two platforms are equal only when both fields match exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
        }
    }

    /// Parse a comma separated platform list such as `linux/amd64,linux/arm64`.
    pub fn parse_list(s: &str) -> Result<Vec<Self>, Error> {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::new("linux", "amd64")
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // A trailing variant (linux/arm/v7) is accepted but not kept.
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(os), Some(arch), _, None) if !os.is_empty() && !arch.is_empty() => {
                Ok(Self::new(os, arch))
            }
            _ => Err(Error::InvalidPlatform(s.to_string())),
        }
    }
}

impl Display for Platform {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)
    }
}

/// Content address of a blob, e.g. `sha256:9f86d0...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(String);

impl Digest {
    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map(|(a, _)| a).unwrap_or_default()
    }

    pub fn hex(&self) -> &str {
        self.0.split_once(':').map(|(_, h)| h).unwrap_or_default()
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((algorithm, hex))
                if !algorithm.is_empty()
                    && algorithm.chars().all(|c| c.is_ascii_alphanumeric() || "+._-".contains(c))
                    && hex.len() >= 32
                    && hex.chars().all(|c| c.is_ascii_hexdigit()) =>
            {
                Ok(Self(s.to_string()))
            }
            _ => Err(Error::InvalidDigest(s.to_string())),
        }
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An OCI image layout directory holding the blobs of a build.
///
/// When the layout lives in a temporary directory, the directory is removed once the
/// last image referring to it is dropped.
#[derive(Debug)]
pub struct Layout {
    root: PathBuf,
    _tempdir: Option<tempfile::TempDir>,
}

impl Layout {
    #[cfg(test)]
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            _tempdir: None,
        }
    }

    pub fn temporary(dir: tempfile::TempDir) -> Self {
        Self {
            root: dir.path().to_path_buf(),
            _tempdir: Some(dir),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("blobs").join(digest.algorithm()).join(digest.hex())
    }
}

/// A platform specific image, identified by its manifest digest.
#[derive(Debug, Clone)]
pub struct SingleImage {
    pub digest: Digest,
    pub layout: Arc<Layout>,
}

impl PartialEq for SingleImage {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

/// One manifest listed in an image collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionEntry {
    /// Entries without a platform can not be selected.
    pub platform: Option<Platform>,
    /// CPU variant (`v7` in `linux/arm/v7`). Used for naming, never for selection.
    pub variant: Option<String>,
    pub digest: Digest,
}

/// A multi-platform image index.
#[derive(Debug, Clone)]
pub struct ImageCollection {
    pub digest: Digest,
    pub entries: Vec<CollectionEntry>,
    pub layout: Arc<Layout>,
}

impl ImageCollection {
    /// Resolve a manifest digest listed in this collection.
    ///
    /// Every listed digest is expected to be present in the layout; this is not verified here.
    pub fn image(&self, digest: &Digest) -> SingleImage {
        SingleImage {
            digest: digest.clone(),
            layout: self.layout.clone(),
        }
    }
}

/// Output of a build: either one image or a collection of platform specific images.
#[derive(Debug, Clone)]
pub enum BuildResult {
    Image(SingleImage),
    Collection(ImageCollection),
}

impl BuildResult {
    /// Digest of the top level manifest or index.
    pub fn digest(&self) -> &Digest {
        match self {
            BuildResult::Image(image) => &image.digest,
            BuildResult::Collection(collection) => &collection.digest,
        }
    }
}
