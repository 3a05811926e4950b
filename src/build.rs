use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use thiserror::Error;

use crate::cache::Cache;
use crate::docker;
use crate::image::{BuildResult, Layout, Platform};
use crate::oci;
use crate::publish::BUILD_SCHEME;
use crate::sdk;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("dockerfile generation failed: {0}")]
    Generate(#[from] sdk::Error),

    #[error("docker error: {0}")]
    Docker(#[from] docker::Error),

    #[error("reading build output: {0}")]
    Layout(#[from] oci::Error),

    #[error("creating build output directory: {0}")]
    TempDir(Arc<std::io::Error>),

    #[error("no platforms to build for")]
    NoPlatforms,
}

/// Turns an import path into a built image.
#[async_trait]
pub trait Builder: Send + Sync {
    async fn build(&self, import_path: &str) -> Result<BuildResult, Error>;
}

/// Builds every import path at most once.
pub struct CachingBuilder<B> {
    inner: B,
    cache: Cache<String, BuildResult, Error>,
}

impl<B: Builder> CachingBuilder<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            cache: Cache::new(),
        }
    }

    /// Remember failed builds too, so an import path is attempted at most once.
    pub fn caching_failures(mut self) -> Self {
        self.cache = self.cache.caching_failures();
        self
    }
}

#[async_trait]
impl<B: Builder> Builder for CachingBuilder<B> {
    async fn build(&self, import_path: &str) -> Result<BuildResult, Error> {
        self.cache
            .get_or_compute(import_path.to_string(), || self.inner.build(import_path))
            .await
    }
}

/// Builds Go packages with `docker buildx`, one image per platform.
pub struct GoBuilder {
    context: PathBuf,
    base_image: String,
    builder_image: String,
    platforms: Vec<Platform>,
}

impl GoBuilder {
    pub fn new(
        context: impl Into<PathBuf>,
        base_image: &str,
        builder_image: &str,
        platforms: Vec<Platform>,
    ) -> Result<Self, Error> {
        if platforms.is_empty() {
            return Err(Error::NoPlatforms);
        }
        Ok(Self {
            context: context.into(),
            base_image: base_image.to_string(),
            builder_image: builder_image.to_string(),
            platforms,
        })
    }
}

#[async_trait]
impl Builder for GoBuilder {
    async fn build(&self, import_path: &str) -> Result<BuildResult, Error> {
        let import_path = import_path.strip_prefix(BUILD_SCHEME).unwrap_or(import_path);
        let sdk = sdk::detect(&self.context, import_path, &self.builder_image, &self.base_image)?;
        let dockerfile = sdk.dockerfile()?;

        let output = tempfile::tempdir().map_err(|err| Error::TempDir(Arc::new(err)))?;
        info!("Building {import_path} for {}", display_platforms(&self.platforms));
        docker::build(&dockerfile, sdk.filesystem_path(), &self.platforms, output.path()).await?;

        let result = tokio::task::spawn_blocking(move || oci::read_layout(Layout::temporary(output)))
            .await
            .map_err(|err| Error::TempDir(Arc::new(std::io::Error::other(err))))??;
        info!("Built {import_path}: {}", result.digest());
        Ok(result)
    }
}

fn display_platforms(platforms: &[Platform]) -> String {
    platforms
        .iter()
        .map(Platform::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
