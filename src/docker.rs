use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use log::debug;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::image::Platform;
use crate::reference::Reference;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("docker buildx build failed with exit code {0}")]
    Build(i32),

    #[error("docker load failed with exit code {0}")]
    Load(i32),

    #[error("docker tag failed with exit code {0}")]
    Tag(i32),

    #[error("docker login failed with exit code {0}")]
    Login(i32),

    #[error("docker logout failed with exit code {0}")]
    Logout(i32),

    #[error("docker push failed with exit code {0}")]
    Push(i32),

    #[error("docker manifest failed with exit code {0}")]
    Manifest(i32),

    #[error(transparent)]
    IOError(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IOError(Arc::new(err))
    }
}

fn docker() -> Command {
    let mut command = Command::new("docker");
    command
        .kill_on_drop(true)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    command
}

async fn status(mut command: Command, failed: fn(i32) -> Error) -> Result<(), Error> {
    debug!("running {:?}", command.as_std());
    command.status().await.map(|exit_status| {
        if exit_status.success() {
            Ok(())
        } else {
            Err(failed(exit_status.code().unwrap_or(-1)))
        }
    })?
}

/// Build `dockerfile` in `context` for every platform and write the result as an
/// OCI image layout directory at `output`.
pub async fn build(
    dockerfile: &str,
    context: &Path,
    platforms: &[Platform],
    output: &Path,
) -> Result<(), Error> {
    let mut file = tempfile::NamedTempFile::new()?;
    std::io::Write::write_all(&mut file, dockerfile.as_bytes())?;

    let platforms = platforms
        .iter()
        .map(Platform::to_string)
        .collect::<Vec<_>>()
        .join(",");

    let mut command = docker();
    command
        .arg("buildx")
        .arg("build")
        .arg("--file")
        .arg(file.path())
        .arg("--platform")
        .arg(platforms)
        // Attestation manifests would turn every build into an index.
        .arg("--provenance=false")
        .arg("--output")
        .arg(format!("type=oci,dest={},tar=false", output.display()))
        .arg(context);
    status(command, Error::Build).await
}

/// Load an image archive into the local image store.
pub async fn load(archive: &Path) -> Result<(), Error> {
    let mut command = docker();
    command.arg("load").arg("--input").arg(archive);
    status(command, Error::Load).await
}

pub async fn tag(source: &Reference, target: &Reference) -> Result<(), Error> {
    let mut command = docker();
    command
        .arg("tag")
        .arg(source.to_string())
        .arg(target.to_string());
    status(command, Error::Tag).await
}

pub async fn push(reference: &Reference) -> Result<(), Error> {
    debug!("Pushing image {}", reference);
    let mut command = docker();
    command.arg("push").arg(reference.to_string());
    status(command, Error::Push).await
}

/// Create (or replace) a manifest list from already pushed images and push it.
pub async fn push_manifest_list(list: &Reference, members: &[Reference]) -> Result<(), Error> {
    let mut create = docker();
    create.arg("manifest").arg("create").arg("--amend").arg(list.to_string());
    for member in members {
        create.arg(member.to_string());
    }
    status(create, Error::Manifest).await?;

    let mut push = docker();
    push.arg("manifest")
        .arg("push")
        .arg("--purge")
        .arg(list.to_string());
    status(push, Error::Manifest).await
}

pub async fn login(registry: &str, username: &str, password: &str) -> Result<(), Error> {
    debug!("Logging in to Docker registry {} as {}", registry, username);
    let mut child = docker()
        .arg("login")
        .arg(registry)
        .arg("--username")
        .arg(username)
        .arg("--password-stdin")
        .stdin(Stdio::piped())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(password.as_bytes()).await?;
    }
    let exit_status = child.wait().await?;
    if exit_status.success() {
        Ok(())
    } else {
        Err(Error::Login(exit_status.code().unwrap_or(-1)))
    }
}

pub async fn logout(registry: &str) -> Result<(), Error> {
    let mut command = docker();
    command.arg("logout").arg(registry);
    status(command, Error::Logout).await
}
