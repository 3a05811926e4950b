use async_trait::async_trait;
use log::{info, warn};
use tokio::sync::OnceCell;

use super::daemon::{DockerDaemon, ImageStore, StoreError};
use super::{normalize_identity, tagged_reference, Error, Namer, Publisher};
use crate::auth::{self, Credentials};
use crate::docker;
use crate::image::{BuildResult, Platform, SingleImage};
use crate::reference::Reference;

/// Pushing side of a remote registry.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn login(&self, registry: &str, username: &str, password: &str) -> Result<(), StoreError>;
    async fn logout(&self, registry: &str) -> Result<(), StoreError>;
    async fn push(&self, reference: &Reference) -> Result<(), StoreError>;
    async fn push_manifest_list(&self, list: &Reference, members: &[Reference]) -> Result<(), StoreError>;
}

#[async_trait]
impl Registry for DockerDaemon {
    async fn login(&self, registry: &str, username: &str, password: &str) -> Result<(), StoreError> {
        Ok(docker::login(registry, username, password).await?)
    }

    async fn logout(&self, registry: &str) -> Result<(), StoreError> {
        Ok(docker::logout(registry).await?)
    }

    async fn push(&self, reference: &Reference) -> Result<(), StoreError> {
        Ok(docker::push(reference).await?)
    }

    async fn push_manifest_list(&self, list: &Reference, members: &[Reference]) -> Result<(), StoreError> {
        Ok(docker::push_manifest_list(list, members).await?)
    }
}

/// Publishes to a remote registry by staging images in the local docker daemon and pushing
/// them. Collections are pushed per platform and joined into a manifest list for every tag.
pub struct RegistryPublisher<S = DockerDaemon> {
    namer: Namer,
    repository: String,
    tags: Vec<String>,
    username: Option<String>,
    password: Option<String>,
    store: S,
    /// Registry host logged into, once resolved.
    session: OnceCell<Option<String>>,
}

impl RegistryPublisher<DockerDaemon> {
    pub fn new(
        namer: Namer,
        repository: &str,
        tags: Vec<String>,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        Self::with_store(namer, repository, tags, username, password, DockerDaemon)
    }
}

impl<S: ImageStore + Registry> RegistryPublisher<S> {
    pub fn with_store(
        namer: Namer,
        repository: &str,
        tags: Vec<String>,
        username: Option<String>,
        password: Option<String>,
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
            username,
            password,
            store,
            session: OnceCell::new(),
        }
    }

    async fn login(&self, reference: &Reference) -> Result<(), Error> {
        self.session
            .get_or_try_init(|| async {
                let registry = reference.registry();
                let credentials = auth::resolve(
                    registry,
                    self.username.as_deref(),
                    self.password.as_deref(),
                )
                .await;
                match (credentials, registry) {
                    (Credentials::Basic { username, password }, Some(registry)) => {
                        info!("Logging in to {registry} as {username}");
                        self.store
                            .login(registry, &username, &password)
                            .await
                            .map(|()| Some(registry.to_string()))
                            .map_err(|cause| Error::Login(format!("{registry}: {cause}")))
                    }
                    (Credentials::Basic { .. }, None) => Err(Error::Login(format!(
                        "{} names no registry host to log in to",
                        reference.repository()
                    ))),
                    (Credentials::Ambient, _) => Ok(None),
                }
            })
            .await
            .map(|_| ())
    }

    async fn push(&self, reference: &Reference) -> Result<(), Error> {
        info!("Pushing {reference}");
        self.store
            .push(reference)
            .await
            .map_err(|cause| Error::PushFailed {
                reference: reference.to_string(),
                cause,
            })?;
        info!("Pushed {reference}");
        Ok(())
    }

    async fn stage(&self, image: &SingleImage, reference: &Reference) -> Result<(), Error> {
        self.store
            .load(image, reference)
            .await
            .map_err(|cause| Error::DaemonLoadFailed {
                reference: reference.to_string(),
                cause,
            })
    }
}

/// `<tag>-<os>-<arch>[-<variant>]`, the name each platform image of a collection is pushed as.
fn member_tag(tag: &str, platform: &Platform, variant: Option<&str>) -> String {
    match variant {
        Some(variant) => format!("{tag}-{}-{}-{variant}", platform.os, platform.architecture),
        None => format!("{tag}-{}-{}", platform.os, platform.architecture),
    }
}

#[async_trait]
impl<S: ImageStore + Registry> Publisher for RegistryPublisher<S> {
    async fn publish(&self, result: &BuildResult, identity: &str) -> Result<Reference, Error> {
        let identity = normalize_identity(identity);
        let targets = self
            .tags
            .iter()
            .map(|tag| tagged_reference(&self.namer, &self.repository, &identity, tag))
            .collect::<Result<Vec<_>, _>>()?;
        let primary = targets[0].clone();

        self.login(&primary).await?;

        match result {
            BuildResult::Image(image) => {
                self.stage(image, &primary).await?;
                let mut pushed = Vec::with_capacity(self.tags.len());
                for (tag, target) in self.tags.iter().zip(&targets) {
                    if target != &primary {
                        self.store
                            .tag(&primary, target)
                            .await
                            .map_err(|cause| Error::DaemonTagFailed {
                                tag: tag.clone(),
                                applied: pushed.clone(),
                                cause,
                            })?;
                    }
                    self.push(target).await?;
                    pushed.push(tag.clone());
                }
            }
            BuildResult::Collection(collection) => {
                let mut members = Vec::new();
                for entry in &collection.entries {
                    let Some(platform) = &entry.platform else {
                        continue;
                    };
                    let tag = member_tag(&self.tags[0], platform, entry.variant.as_deref());
                    let member = tagged_reference(&self.namer, &self.repository, &identity, &tag)?;
                    if members.contains(&member) {
                        return Err(Error::UnsupportedBuildResult {
                            identity,
                            reason: format!("image index lists {platform} more than once as {tag}"),
                        });
                    }
                    self.stage(&collection.image(&entry.digest), &member).await?;
                    self.push(&member).await?;
                    members.push(member);
                }
                if members.is_empty() {
                    return Err(Error::UnsupportedBuildResult {
                        identity,
                        reason: "image index lists no platform images".to_string(),
                    });
                }
                for target in &targets {
                    info!("Pushing manifest list {target}");
                    self.store
                        .push_manifest_list(target, &members)
                        .await
                        .map_err(|cause| Error::PushFailed {
                            reference: target.to_string(),
                            cause,
                        })?;
                }
            }
        }

        Ok(primary)
    }

    async fn close(&self) -> Result<(), Error> {
        if let Some(Some(registry)) = self.session.get() {
            if let Err(err) = self.store.logout(registry).await {
                warn!("logout from {registry} failed: {err}");
                return Err(Error::Logout(format!("{registry}: {err}")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::publish::daemon::tests::{FakeStore, Op};
    use crate::publish::Naming;
    use crate::select::tests::{collection, single};

    #[derive(Default, Clone)]
    struct FakeRegistry {
        store: FakeStore,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl FakeRegistry {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ImageStore for FakeRegistry {
        async fn load(&self, image: &SingleImage, reference: &Reference) -> Result<(), StoreError> {
            self.store.load(image, reference).await
        }

        async fn tag(&self, source: &Reference, target: &Reference) -> Result<(), StoreError> {
            self.store.tag(source, target).await
        }
    }

    #[async_trait]
    impl Registry for FakeRegistry {
        async fn login(&self, registry: &str, username: &str, _: &str) -> Result<(), StoreError> {
            self.events.lock().unwrap().push(format!("login {registry} {username}"));
            Ok(())
        }

        async fn logout(&self, registry: &str) -> Result<(), StoreError> {
            self.events.lock().unwrap().push(format!("logout {registry}"));
            Ok(())
        }

        async fn push(&self, reference: &Reference) -> Result<(), StoreError> {
            self.events.lock().unwrap().push(format!("push {reference}"));
            Ok(())
        }

        async fn push_manifest_list(&self, list: &Reference, members: &[Reference]) -> Result<(), StoreError> {
            let members: Vec<_> = members.iter().map(ToString::to_string).collect();
            self.events
                .lock()
                .unwrap()
                .push(format!("manifest {list} {}", members.join(" ")));
            Ok(())
        }
    }

    fn publisher(registry: &FakeRegistry, username: Option<&str>) -> RegistryPublisher<FakeRegistry> {
        RegistryPublisher::with_store(
            Naming::Bare.namer(),
            "example.com/app",
            vec!["v1".into(), "latest".into()],
            username.map(String::from),
            username.map(|_| "secret".to_string()),
            registry.clone(),
        )
    }

    #[tokio::test]
    async fn pushes_every_tag_of_an_image() {
        let registry = FakeRegistry::default();
        let publisher = publisher(&registry, None);

        let reference = publisher.publish(&single('a'), "./cmd/app").await.unwrap();

        assert_eq!(reference.to_string(), "example.com/app:v1");
        assert_eq!(
            registry.events(),
            vec!["push example.com/app:v1", "push example.com/app:latest"]
        );
        assert_eq!(
            registry.store.ops()[1],
            Op::Tag {
                source: "example.com/app:v1".into(),
                target: "example.com/app:latest".into(),
            }
        );
    }

    #[tokio::test]
    async fn collections_become_manifest_lists() {
        let registry = FakeRegistry::default();
        let publisher = publisher(&registry, None);
        let result = collection(&[
            (Some("linux/amd64"), 'a'),
            (None, 'c'),
            (Some("linux/arm64"), 'b'),
        ]);

        publisher.publish(&result, "./cmd/app").await.unwrap();

        let members = "example.com/app:v1-linux-amd64 example.com/app:v1-linux-arm64";
        assert_eq!(
            registry.events(),
            vec![
                "push example.com/app:v1-linux-amd64".to_string(),
                "push example.com/app:v1-linux-arm64".to_string(),
                format!("manifest example.com/app:v1 {members}"),
                format!("manifest example.com/app:latest {members}"),
            ]
        );
    }

    #[tokio::test]
    async fn variants_get_their_own_member_tags() {
        let registry = FakeRegistry::default();
        let publisher = publisher(&registry, None);
        let result = collection(&[(Some("linux/arm/v6"), 'a'), (Some("linux/arm/v7"), 'b')]);

        publisher.publish(&result, "./cmd/app").await.unwrap();

        let members = "example.com/app:v1-linux-arm-v6 example.com/app:v1-linux-arm-v7";
        assert_eq!(
            registry.events(),
            vec![
                "push example.com/app:v1-linux-arm-v6".to_string(),
                "push example.com/app:v1-linux-arm-v7".to_string(),
                format!("manifest example.com/app:v1 {members}"),
                format!("manifest example.com/app:latest {members}"),
            ]
        );
    }

    #[tokio::test]
    async fn duplicate_platforms_are_rejected() {
        let registry = FakeRegistry::default();
        let publisher = publisher(&registry, None);
        let result = collection(&[(Some("linux/arm"), 'a'), (Some("linux/arm"), 'b')]);

        let err = publisher.publish(&result, "./cmd/app").await.unwrap_err();

        assert!(matches!(err, Error::UnsupportedBuildResult { .. }));
        assert_eq!(registry.events(), vec!["push example.com/app:v1-linux-arm"]);
        assert!(!registry.events().iter().any(|e| e.starts_with("manifest")));
    }

    #[tokio::test]
    async fn logs_in_once_and_out_on_close() {
        let registry = FakeRegistry::default();
        let publisher = publisher(&registry, Some("me"));

        publisher.publish(&single('a'), "./cmd/app").await.unwrap();
        publisher.publish(&single('b'), "./cmd/app").await.unwrap();
        publisher.close().await.unwrap();

        let events = registry.events();
        assert_eq!(events.iter().filter(|e| e.starts_with("login")).count(), 1);
        assert_eq!(events.first().unwrap(), "login example.com me");
        assert_eq!(events.last().unwrap(), "logout example.com");
    }

    #[tokio::test]
    async fn no_logout_without_login() {
        let registry = FakeRegistry::default();
        let publisher = publisher(&registry, None);

        publisher.publish(&single('a'), "./cmd/app").await.unwrap();
        publisher.close().await.unwrap();

        assert!(!registry.events().iter().any(|e| e.starts_with("logout")));
    }
}
