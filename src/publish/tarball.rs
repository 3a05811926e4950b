use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use log::info;

use super::{normalize_identity, tagged_reference, Error, Namer, Publisher};
use crate::image::{BuildResult, SingleImage};
use crate::oci;
use crate::reference::Reference;

/// Collects published images and writes them as one OCI archive when closed.
pub struct TarballPublisher {
    namer: Namer,
    repository: String,
    tags: Vec<String>,
    path: PathBuf,
    images: Mutex<Vec<(SingleImage, Reference)>>,
}

impl TarballPublisher {
    pub fn new(namer: Namer, repository: &str, tags: Vec<String>, path: impl Into<PathBuf>) -> Self {
        let tags = if tags.is_empty() {
            vec!["latest".to_string()]
        } else {
            tags
        };
        Self {
            namer,
            repository: repository.to_string(),
            tags,
            path: path.into(),
            images: Mutex::new(Vec::new()),
        }
    }

    fn failed(&self, cause: impl ToString) -> Error {
        Error::TarballFailed {
            path: self.path.display().to_string(),
            cause: cause.to_string(),
        }
    }
}

#[async_trait]
impl Publisher for TarballPublisher {
    async fn publish(&self, result: &BuildResult, identity: &str) -> Result<Reference, Error> {
        let identity = normalize_identity(identity);
        let image = match result {
            BuildResult::Image(image) => image,
            BuildResult::Collection(_) => {
                return Err(Error::UnsupportedBuildResult {
                    identity,
                    reason: "tarballs hold single platform images only".to_string(),
                })
            }
        };

        let targets = self
            .tags
            .iter()
            .map(|tag| tagged_reference(&self.namer, &self.repository, &identity, tag))
            .collect::<Result<Vec<_>, _>>()?;
        let primary = targets[0].clone();

        let mut images = self.images.lock().map_err(|_| self.failed("image list poisoned"))?;
        images.extend(targets.into_iter().map(|target| (image.clone(), target)));
        info!("Added {primary} to {}", self.path.display());

        Ok(primary)
    }

    async fn close(&self) -> Result<(), Error> {
        let images = std::mem::take(
            &mut *self.images.lock().map_err(|_| self.failed("image list poisoned"))?,
        );
        if images.is_empty() {
            return Ok(());
        }

        let file = std::fs::File::create(&self.path).map_err(|err| self.failed(err))?;
        info!("Writing {} image references to {}", images.len(), self.path.display());
        tokio::task::spawn_blocking(move || oci::write_archive(&images, file))
            .await
            .map_err(|err| self.failed(err))?
            .map_err(|err| self.failed(err))?;
        Ok(())
    }
}
