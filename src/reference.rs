//! Image references, following the grammar of the distribution project:
//!
//! ```text
//! reference        := name [ ":" tag ] [ "@" digest ]
//! name             := [domain '/'] path-component ['/' path-component]*
//! domain           := domain-component ['.' domain-component]* [':' port-number]
//! path-component   := alpha-numeric [separator alpha-numeric]*
//! tag              := /[\w][\w.-]{0,127}/
//! ```

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::image::Digest;

const NAME_MAX_LENGTH: usize = 255;

const DOMAIN: &str = r"(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9])(?:\.(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9]))*(?::[0-9]+)?";
const PATH_COMPONENT: &str = r"[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*";
const TAG: &str = r"[\w][\w.-]{0,127}";
const DIGEST: &str = r"[A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*:[0-9a-fA-F]{32,}";

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^(?:{DOMAIN}/)?{PATH_COMPONENT}(?:/{PATH_COMPONENT})*$")).unwrap()
});

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(&format!("^{TAG}$")).unwrap());

static REFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        "^(?P<name>(?:{DOMAIN}/)?{PATH_COMPONENT}(?:/{PATH_COMPONENT})*)(?::(?P<tag>{TAG}))?(?:@(?P<digest>{DIGEST}))?$"
    ))
    .unwrap()
});

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid repository name {0:?}")]
    Repository(String),

    #[error("invalid tag {0:?}")]
    Tag(String),

    #[error("invalid reference {0:?}")]
    Reference(String),

    #[error("repository name {0:?} is longer than {NAME_MAX_LENGTH} characters")]
    NameTooLong(String),
}

/// What a reference points at inside its repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Pointer {
    Tag(String),
    Digest(Digest),
}

/// A repository plus a tag or a digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    repository: String,
    pointer: Pointer,
}

fn validate_repository(repository: &str) -> Result<(), Error> {
    if repository.len() > NAME_MAX_LENGTH {
        return Err(Error::NameTooLong(repository.to_string()));
    }
    if !NAME_RE.is_match(repository) {
        return Err(Error::Repository(repository.to_string()));
    }
    Ok(())
}

impl Reference {
    pub fn tag(repository: &str, tag: &str) -> Result<Self, Error> {
        validate_repository(repository)?;
        if !TAG_RE.is_match(tag) {
            return Err(Error::Tag(tag.to_string()));
        }
        Ok(Self {
            repository: repository.to_string(),
            pointer: Pointer::Tag(tag.to_string()),
        })
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn pointer(&self) -> &Pointer {
        &self.pointer
    }

    /// Registry host part of the repository, if the first component looks like one.
    pub fn registry(&self) -> Option<&str> {
        let (first, _) = self.repository.split_once('/')?;
        if first.contains('.') || first.contains(':') || first == "localhost" {
            Some(first)
        } else {
            None
        }
    }
}

impl FromStr for Reference {
    type Err = Error;

    /// Parse a reference string. A bare name implies the `latest` tag.
    /// When both a tag and a digest are present, the digest wins.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let captures = REFERENCE_RE
            .captures(s)
            .ok_or_else(|| Error::Reference(s.to_string()))?;
        let repository = &captures["name"];
        if repository.len() > NAME_MAX_LENGTH {
            return Err(Error::NameTooLong(repository.to_string()));
        }
        let pointer = match (captures.name("tag"), captures.name("digest")) {
            (_, Some(digest)) => Pointer::Digest(
                digest
                    .as_str()
                    .parse()
                    .map_err(|_| Error::Reference(s.to_string()))?,
            ),
            (Some(tag), None) => Pointer::Tag(tag.as_str().to_string()),
            (None, None) => Pointer::Tag("latest".to_string()),
        };
        Ok(Self {
            repository: repository.to_string(),
            pointer,
        })
    }
}

impl Display for Reference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.pointer {
            Pointer::Tag(tag) => write!(f, "{}:{}", self.repository, tag),
            Pointer::Digest(digest) => write!(f, "{}@{}", self.repository, digest),
        }
    }
}
