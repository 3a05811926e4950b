use std::sync::Arc;

use async_trait::async_trait;
use clap::ValueEnum;
use serde::Deserialize;
use thiserror::Error;

use crate::image::BuildResult;
use crate::reference::{self, Reference};
use crate::select::NoMatchingPlatform;

mod caching;
mod daemon;
mod multi;
mod registry;
mod tarball;

pub use caching::CachingPublisher;
pub use daemon::{DaemonPublisher, StoreError};
pub use multi::MultiPublisher;
pub use registry::RegistryPublisher;
pub use tarball::TarballPublisher;

/// Import paths handed to a builder may carry this prefix.
pub const BUILD_SCHEME: &str = "sko://";

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("failed to interpret {identity} result as image: {reason}")]
    UnsupportedBuildResult { identity: String, reason: String },

    #[error(transparent)]
    NoMatchingPlatform(#[from] NoMatchingPlatform),

    #[error("invalid reference {reference:?}: {cause}")]
    InvalidReference {
        reference: String,
        cause: reference::Error,
    },

    #[error("loading {reference} into the local image store: {cause}")]
    DaemonLoadFailed {
        reference: String,
        cause: StoreError,
    },

    #[error("adding tag {tag} (already applied: {}): {cause}", display_tags(.applied))]
    DaemonTagFailed {
        tag: String,
        applied: Vec<String>,
        cause: StoreError,
    },

    #[error("no publishers configured")]
    NoPublishers,

    #[error("publisher {index} failed: {cause}")]
    PublisherFailed { index: usize, cause: Box<Error> },

    #[error("closing publishers: {}", display_close_errors(.0))]
    CloseFailed(Vec<(usize, Error)>),

    #[error("pushing {reference}: {cause}")]
    PushFailed {
        reference: String,
        cause: StoreError,
    },

    #[error("registry login: {0}")]
    Login(String),

    #[error("registry logout: {0}")]
    Logout(String),

    #[error("writing tarball {path}: {cause}")]
    TarballFailed { path: String, cause: String },
}

fn display_tags(tags: &[String]) -> String {
    if tags.is_empty() {
        "none".to_string()
    } else {
        tags.join(", ")
    }
}

fn display_close_errors(errors: &[(usize, Error)]) -> String {
    errors
        .iter()
        .map(|(index, err)| format!("publisher {index}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// A destination for build results.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Deliver `result`, built from `identity`, and return where it ended up.
    async fn publish(&self, result: &BuildResult, identity: &str) -> Result<Reference, Error>;

    /// Release anything the publisher holds. Called once, after the last publish.
    async fn close(&self) -> Result<(), Error>;
}

#[async_trait]
impl<P: Publisher + ?Sized> Publisher for Box<P> {
    async fn publish(&self, result: &BuildResult, identity: &str) -> Result<Reference, Error> {
        (**self).publish(result, identity).await
    }

    async fn close(&self) -> Result<(), Error> {
        (**self).close().await
    }
}

/// Maps a repository base and a normalized identity to a repository name.
pub type Namer = Arc<dyn Fn(&str, &str) -> String + Send + Sync>;

/// How the identity participates in the destination repository name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Naming {
    /// Publish to the repository base, ignoring the identity.
    #[default]
    Bare,
    /// Append the last element of the identity.
    Base,
    /// Append the whole identity.
    Preserve,
    /// Append the last element and a hash of the identity.
    Hashed,
}

impl Naming {
    pub fn namer(self) -> Namer {
        match self {
            Naming::Bare => Arc::new(|base: &str, _: &str| base.to_string()),
            Naming::Base => Arc::new(|base: &str, identity: &str| {
                join_repository(base, last_element(identity))
            }),
            Naming::Preserve => Arc::new(|base: &str, identity: &str| {
                join_repository(base, identity.trim_start_matches("./"))
            }),
            Naming::Hashed => Arc::new(|base: &str, identity: &str| {
                let digest = sha256::digest(identity);
                let hash = &digest[..32];
                join_repository(base, &format!("{}-{hash}", last_element(identity)))
            }),
        }
    }
}

fn last_element(identity: &str) -> &str {
    identity
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(identity)
}

fn join_repository(base: &str, suffix: &str) -> String {
    let suffix = suffix.trim_matches('/');
    if suffix.is_empty() || suffix == "." {
        base.to_string()
    } else {
        format!("{}/{suffix}", base.trim_end_matches('/'))
    }
}

/// Strip the build scheme and lowercase, since repository names must be lowercase.
pub fn normalize_identity(identity: &str) -> String {
    identity
        .strip_prefix(BUILD_SCHEME)
        .unwrap_or(identity)
        .to_lowercase()
}

/// Compose `<name(base, identity)>:<tag>`.
pub fn tagged_reference(
    namer: &Namer,
    repository_base: &str,
    identity: &str,
    tag: &str,
) -> Result<Reference, Error> {
    let repository = namer(repository_base, identity);
    Reference::tag(&repository, tag).map_err(|cause| Error::InvalidReference {
        reference: format!("{repository}:{tag}"),
        cause,
    })
}
