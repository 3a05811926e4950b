/// sko: build Go programs into container images and publish them.
use std::path::{Path, PathBuf};

use clap::Parser;
use log::{debug, error, info, warn};
use thiserror::Error;

use crate::publish::Naming;

mod auth;
mod build;
mod cache;
mod config;
mod docker;
mod image;
mod oci;
mod orchestrator;
mod publish;
mod reference;
mod sdk;
mod select;

/// Build a Go import path into a container image and push it to a registry, load it into the
/// local docker daemon or write it to a tarball.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
#[command(after_help = "Examples:\n  sko dvob/http-server .\n  sko --tag v0.0.4 quay.io/foo/bar ./cmd/bar")]
struct Cli {
    /// Repository the image is published to.
    image: String,

    /// Go import path to build.
    import_path: String,

    /// Tags to publish. Can be given multiple times; `latest` when omitted.
    #[arg(short, long = "tag", env = "SKO_TAG", value_delimiter = ',')]
    tags: Vec<String>,

    /// Load the image into the local docker daemon instead of pushing it.
    #[arg(long, env = "SKO_LOCAL", conflicts_with = "tar")]
    local: bool,

    /// Save the image to a tarball instead of pushing it.
    #[arg(long, env = "SKO_TAR", value_name = "PATH")]
    tar: Option<PathBuf>,

    /// Base image of the runtime stage.
    #[arg(long, env = "SKO_BASE")]
    base: Option<String>,

    /// Platforms to build, comma separated.
    #[arg(long, env = "SKO_PLATFORM")]
    platform: Option<String>,

    /// Registry user used for push.
    #[arg(long, env = "SKO_USER")]
    user: Option<String>,

    /// Registry password used for push.
    #[arg(long, env = "SKO_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// How the import path is reflected in the repository name.
    #[arg(long, env = "SKO_NAMING", value_enum)]
    naming: Option<Naming>,

    /// Path to the sko configuration file.
    #[arg(long, env = "SKO_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration file: {0}")]
    ConfigParse(#[from] config::file::Error),

    #[error("configuration: {0}")]
    Config(#[from] config::runtime::Error),

    #[error(transparent)]
    Orchestrator(#[from] orchestrator::Error),
}

/// Read configuration file from disk and merge it with the
/// `default.toml` [built-in config](../default.toml).
///
/// Without an explicit file name, `sko.toml` in the working directory is used when it exists.
fn read_config(path: Option<&Path>) -> Result<config::file::File, Error> {
    const DEFAULT_CONFIG_FILE: &str = "sko.toml";

    let config_file = match path {
        Some(path) => Some(path.to_path_buf()),
        None => std::fs::metadata(DEFAULT_CONFIG_FILE)
            .map(|metadata| metadata.is_file())
            .unwrap_or(false)
            .then(|| PathBuf::from(DEFAULT_CONFIG_FILE)),
    };

    Ok(match config_file {
        Some(config_file) => {
            debug!("reading configuration from {}", config_file.display());
            config::file::File::default_with_user_config_file(&config_file)?
        }
        None => config::file::File::default(),
    })
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Cli::parse();
    match run(args).await {
        Ok(_) => std::process::exit(0),
        Err(Error::Orchestrator(orchestrator::Error::Interrupted)) => {
            error!("interrupted");
            std::process::exit(130)
        }
        Err(err) => {
            error!("fatal: {}", err);
            std::process::exit(1)
        }
    }
}

/// Completes on the first interrupt. If the handler can not be installed, never completes.
async fn interrupted() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("can not listen for interrupts: {err}");
        std::future::pending::<()>().await;
    }
}

async fn run(args: Cli) -> Result<(), Error> {
    info!("sko {}", env!("CARGO_PKG_VERSION"));

    let cfg_file = read_config(args.config.as_deref())?;
    let flags = config::runtime::Flags {
        image: args.image,
        import_path: args.import_path,
        tags: args.tags,
        local: args.local,
        tar: args.tar,
        base: args.base,
        platform: args.platform,
        user: args.user,
        password: args.password,
        naming: args.naming,
    };
    let env = config::runtime::Environment::from_process();
    let cfg = config::runtime::Config::new(&cfg_file, flags, &env)?;

    orchestrator::build_and_publish(&cfg, interrupted()).await?;
    Ok(())
}
