use std::future::Future;

use log::{info, warn};
use thiserror::Error;

use crate::build::{self, Builder, CachingBuilder, GoBuilder};
use crate::config::runtime::{Config, Destination};
use crate::publish::{
    self, CachingPublisher, DaemonPublisher, MultiPublisher, Publisher, RegistryPublisher,
    TarballPublisher,
};
use crate::reference::Reference;

#[derive(Error, Debug)]
pub enum Error {
    #[error("build: {0}")]
    Build(#[from] build::Error),

    #[error("publish: {0}")]
    Publish(#[from] publish::Error),

    #[error("interrupted")]
    Interrupted,
}

/// Publishers for the configured destination, fanned out and memoized.
pub fn publisher(cfg: &Config) -> CachingPublisher<MultiPublisher> {
    let namer = cfg.naming.namer();
    let destination: Box<dyn Publisher> = match &cfg.destination {
        Destination::Tarball(path) => Box::new(TarballPublisher::new(
            namer,
            &cfg.image,
            cfg.tags.clone(),
            path,
        )),
        Destination::Daemon => Box::new(DaemonPublisher::new(
            namer,
            &cfg.image,
            cfg.tags.clone(),
            cfg.daemon_platform.clone(),
        )),
        Destination::Registry { username, password } => Box::new(RegistryPublisher::new(
            namer,
            &cfg.image,
            cfg.tags.clone(),
            username.clone(),
            password.clone(),
        )),
    };
    let publisher = CachingPublisher::new(MultiPublisher::new(vec![destination]));
    if cfg.cache_failures {
        publisher.caching_failures()
    } else {
        publisher
    }
}

/// Go builder for the current directory, memoized per import path.
pub fn builder(cfg: &Config) -> Result<CachingBuilder<GoBuilder>, Error> {
    let go = GoBuilder::new(
        ".",
        &cfg.base.to_string(),
        &cfg.builder_image,
        cfg.platforms.clone(),
    )?;
    let builder = CachingBuilder::new(go);
    Ok(if cfg.cache_failures {
        builder.caching_failures()
    } else {
        builder
    })
}

/// Build `import_path` once and publish it, unless `shutdown` completes first.
///
/// The publisher is closed whatever happens, interruption included; the first error wins.
pub async fn run<B, P, S>(
    builder: &B,
    publisher: &P,
    import_path: &str,
    shutdown: S,
) -> Result<Reference, Error>
where
    B: Builder + ?Sized,
    P: Publisher + ?Sized,
    S: Future<Output = ()>,
{
    let work = async {
        let result = builder.build(import_path).await?;
        Ok::<_, Error>(publisher.publish(&result, import_path).await?)
    };
    let published = tokio::select! {
        published = work => published,
        () = shutdown => {
            warn!("interrupted, closing publishers");
            Err(Error::Interrupted)
        }
    };

    let closed = publisher.close().await;
    match (published, closed) {
        (Ok(reference), Ok(())) => Ok(reference),
        (Ok(_), Err(err)) => Err(err.into()),
        (Err(err), closed) => {
            if let Err(close_err) = closed {
                warn!("closing publishers after failure: {close_err}");
            }
            Err(err)
        }
    }
}

pub async fn build_and_publish<S>(cfg: &Config, shutdown: S) -> Result<Reference, Error>
where
    S: Future<Output = ()>,
{
    let builder = builder(cfg)?;
    let publisher = publisher(cfg);
    let reference = run(&builder, &publisher, &cfg.import_path, shutdown).await?;
    info!("Published {reference}");
    Ok(reference)
}
