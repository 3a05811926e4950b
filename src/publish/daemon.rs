use async_trait::async_trait;
use log::info;

use super::{normalize_identity, tagged_reference, Error, Namer, Publisher};
use crate::docker;
use crate::image::{BuildResult, Platform, SingleImage};
use crate::oci;
use crate::reference::Reference;
use crate::select::select;

#[derive(thiserror::Error, Debug, Clone)]
pub enum StoreError {
    #[error(transparent)]
    Docker(#[from] docker::Error),

    #[error(transparent)]
    Archive(#[from] oci::Error),

    #[error("archive writer stopped unexpectedly")]
    Interrupted,
}

/// The local container runtime's image store.
///
/// Concurrent operations are assumed to be serialized by the runtime itself.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Transfer `image` into the store, named `reference`.
    async fn load(&self, image: &SingleImage, reference: &Reference) -> Result<(), StoreError>;

    /// Point `target` at whatever `source` names.
    async fn tag(&self, source: &Reference, target: &Reference) -> Result<(), StoreError>;
}

/// The docker daemon, driven through the docker CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct DockerDaemon;

#[async_trait]
impl ImageStore for DockerDaemon {
    async fn load(&self, image: &SingleImage, reference: &Reference) -> Result<(), StoreError> {
        let file = tempfile::NamedTempFile::new().map_err(docker::Error::from)?;
        let (file, path) = file.into_parts();
        let images = vec![(image.clone(), reference.clone())];

        tokio::task::spawn_blocking(move || oci::write_archive(&images, file))
            .await
            .map_err(|_| StoreError::Interrupted)??;

        docker::load(&path).await?;
        Ok(())
    }

    async fn tag(&self, source: &Reference, target: &Reference) -> Result<(), StoreError> {
        docker::tag(source, target).await?;
        Ok(())
    }
}

/// Publishes into the local image store: one load, then one alias per tag.
pub struct DaemonPublisher<S = DockerDaemon> {
    namer: Namer,
    repository: String,
    tags: Vec<String>,
    platform: Platform,
    store: S,
}

impl DaemonPublisher<DockerDaemon> {
    pub fn new(namer: Namer, repository: &str, tags: Vec<String>, platform: Platform) -> Self {
        Self::with_store(namer, repository, tags, platform, DockerDaemon)
    }
}

impl<S: ImageStore> DaemonPublisher<S> {
    /// `tags[0]` is the primary tag. An empty list means `latest`.
    pub fn with_store(
        namer: Namer,
        repository: &str,
        tags: Vec<String>,
        platform: Platform,
        store: S,
    ) -> Self {
        let tags = if tags.is_empty() {
            vec!["latest".to_string()]
        } else {
            tags
        };
        Self {
            namer,
            repository: repository.to_string(),
            tags,
            platform,
            store,
        }
    }
}

#[async_trait]
impl<S: ImageStore> Publisher for DaemonPublisher<S> {
    async fn publish(&self, result: &BuildResult, identity: &str) -> Result<Reference, Error> {
        let identity = normalize_identity(identity);
        let image = select(result, &self.platform, &identity)?;

        // Every destination is composed before the store is touched.
        let targets = self
            .tags
            .iter()
            .map(|tag| tagged_reference(&self.namer, &self.repository, &identity, tag))
            .collect::<Result<Vec<_>, _>>()?;
        let primary = targets[0].clone();

        info!("Loading {primary}");
        self.store
            .load(&image, &primary)
            .await
            .map_err(|cause| Error::DaemonLoadFailed {
                reference: primary.to_string(),
                cause,
            })?;
        info!("Loaded {primary}");

        let mut applied = Vec::with_capacity(self.tags.len());
        for (tag, target) in self.tags.iter().zip(&targets) {
            info!("Adding tag {tag}");
            self.store
                .tag(&primary, target)
                .await
                .map_err(|cause| Error::DaemonTagFailed {
                    tag: tag.clone(),
                    applied: applied.clone(),
                    cause,
                })?;
            info!("Added tag {tag}");
            applied.push(tag.clone());
        }

        Ok(primary)
    }

    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}
