use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("no go.mod found in {0}")]
    NoGoModule(String),

    #[error("go.mod in {0} declares no module path")]
    ModulePath(String),

    #[error("import path {0:?} does not name a package")]
    ImportPath(String),

    #[error("reading go.mod: {0}")]
    IOError(Arc<std::io::Error>),
}

/// Something that knows how to produce a Dockerfile for a source tree.
pub trait DockerFileBuilder: Send + Sync {
    fn dockerfile(&self) -> Result<String, Error>;
    fn filesystem_path(&self) -> &Path;
}

pub mod golang {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use super::{DockerFileBuilder, Error};

    /// Directory the binary is installed into inside the image.
    pub const APP_DIR: &str = "/sko-app";

    pub struct Config {
        pub filesystem_path: PathBuf,
        pub import_path: String,
        pub docker_builder_image: String,
        pub docker_runtime_image: String,
    }

    pub struct Golang {
        config: Config,
        module: String,
    }

    /// Returns `Ok(None)` when the directory is not a Go module.
    pub fn new(config: Config) -> Result<Option<Golang>, Error> {
        let go_mod = config.filesystem_path.join("go.mod");
        let contents = match std::fs::read_to_string(&go_mod) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Error::IOError(Arc::new(err))),
        };
        let module = module_path(&contents)
            .ok_or_else(|| Error::ModulePath(config.filesystem_path.display().to_string()))?;
        Ok(Some(Golang {
            module: module.to_string(),
            config,
        }))
    }

    /// The `module` directive of a go.mod file.
    pub fn module_path(go_mod: &str) -> Option<&str> {
        go_mod
            .lines()
            .map(|line| line.split("//").next().unwrap_or_default().trim())
            .find_map(|line| {
                line.strip_prefix("module")
                    .filter(|rest| rest.starts_with(char::is_whitespace))
            })
            .map(|rest| rest.trim().trim_matches('"'))
            .filter(|module| !module.is_empty())
    }

    impl Golang {
        /// Name of the installed binary: the last element of the package path.
        pub fn binary_name(&self) -> Result<String, Error> {
            let package = self.package()?;
            let name = package.rsplit('/').next().unwrap_or(&package);
            if name.is_empty() || name == "." {
                return Err(Error::ImportPath(self.config.import_path.clone()));
            }
            Ok(name.to_string())
        }

        /// Full package path inside the module.
        fn package(&self) -> Result<String, Error> {
            let import_path = self.config.import_path.trim_end_matches('/');
            if import_path == "." || import_path.is_empty() {
                return Ok(self.module.clone());
            }
            if let Some(relative) = import_path.strip_prefix("./") {
                if relative.split('/').any(|element| element == "..") {
                    return Err(Error::ImportPath(self.config.import_path.clone()));
                }
                return Ok(format!("{}/{relative}", self.module));
            }
            if import_path == self.module || import_path.starts_with(&format!("{}/", self.module)) {
                return Ok(import_path.to_string());
            }
            Err(Error::ImportPath(self.config.import_path.clone()))
        }
    }

    impl DockerFileBuilder for Golang {
        fn dockerfile(&self) -> Result<String, Error> {
            let package = self.package()?;
            let name = self.binary_name()?;
            let builder = &self.config.docker_builder_image;
            let runtime = &self.config.docker_runtime_image;
            Ok(format!(
                r#"FROM --platform=$BUILDPLATFORM {builder} AS builder
ARG TARGETOS
ARG TARGETARCH
WORKDIR /src
COPY go.* ./
RUN go mod download
COPY . .
RUN CGO_ENABLED=0 GOOS=$TARGETOS GOARCH=$TARGETARCH go build -trimpath -o /out/{name} {package}

FROM {runtime}
COPY --from=builder /out/{name} {APP_DIR}/{name}
ENTRYPOINT ["{APP_DIR}/{name}"]
"#
            ))
        }

        fn filesystem_path(&self) -> &Path {
            &self.config.filesystem_path
        }
    }

}

/// Detect the SDK for `filesystem_path`. Go is the only one supported.
pub fn detect(
    filesystem_path: &Path,
    import_path: &str,
    docker_builder_image: &str,
    docker_runtime_image: &str,
) -> Result<Box<dyn DockerFileBuilder>, Error> {
    match golang::new(golang::Config {
        filesystem_path: PathBuf::from(filesystem_path),
        import_path: import_path.to_string(),
        docker_builder_image: docker_builder_image.to_string(),
        docker_runtime_image: docker_runtime_image.to_string(),
    })? {
        Some(sdk) => Ok(Box::new(sdk)),
        None => Err(Error::NoGoModule(filesystem_path.display().to_string())),
    }
}
