use async_trait::async_trait;

use super::{Error, Publisher};
use crate::cache::Cache;
use crate::image::BuildResult;
use crate::reference::Reference;

/// Publishes each distinct (identity, build result) pair at most once.
pub struct CachingPublisher<P> {
    inner: P,
    cache: Cache<(String, String), Reference, Error>,
}

impl<P: Publisher> CachingPublisher<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            cache: Cache::new(),
        }
    }

    /// Remember failed publishes too, so a result is attempted at most once.
    pub fn caching_failures(mut self) -> Self {
        self.cache = self.cache.caching_failures();
        self
    }
}

#[async_trait]
impl<P: Publisher> Publisher for CachingPublisher<P> {
    async fn publish(&self, result: &BuildResult, identity: &str) -> Result<Reference, Error> {
        let key = (identity.to_string(), result.digest().to_string());
        self.cache
            .get_or_compute(key, || self.inner.publish(result, identity))
            .await
    }

    async fn close(&self) -> Result<(), Error> {
        self.cache.close();
        self.inner.close().await
    }
}
