pub mod file {
    use std::path::Path;

    use serde::Deserialize;
    use serde_inline_default::serde_inline_default;
    use thiserror::Error;

    use crate::publish::Naming;

    const DEFAULT_CONFIG: &str = include_str!("../default.toml");

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("read {path}: {err}")]
        Read { path: String, err: std::io::Error },

        #[error("parse {path}: {err}")]
        Parse { path: String, err: toml::de::Error },
    }

    /// A sko.toml file.
    #[serde_inline_default]
    #[derive(Deserialize, Debug, Clone, PartialEq)]
    pub struct File {
        pub description: Option<String>,
        pub base: String,
        pub platforms: Vec<String>,
        #[serde(default)]
        pub naming: Naming,
        /// Keep failed builds and publishes for the rest of the run instead of retrying them.
        #[serde_inline_default(false)]
        pub cache_failures: bool,
        #[serde(default)]
        pub sdk: Sdk,
    }

    impl Default for File {
        fn default() -> Self {
            // The default config is compiled into the program, so
            // make sure to test default() to catch panics compile-time.
            toml::from_str(DEFAULT_CONFIG).unwrap()
        }
    }

    #[derive(Deserialize, Debug, Clone, Default, PartialEq)]
    pub struct Sdk {
        #[serde(default)]
        pub go: SdkGolang,
    }

    #[serde_inline_default]
    #[derive(Deserialize, Debug, Clone, PartialEq)]
    pub struct SdkGolang {
        #[serde_inline_default("golang:1-alpine".to_string())]
        pub build_docker_image: String,
    }

    impl Default for SdkGolang {
        fn default() -> Self {
            Self {
                build_docker_image: "golang:1-alpine".to_string(),
            }
        }
    }

    impl File {
        /// Parse `user_config` and lay it over the built-in defaults, table by table.
        pub fn default_with_user_config(user_config: &str, path: &str) -> Result<Self, Error> {
            let parse = |err| Error::Parse {
                path: path.to_string(),
                err,
            };
            let mut merged: toml::Table = toml::from_str(DEFAULT_CONFIG).map_err(parse)?;
            let user: toml::Table = toml::from_str(user_config).map_err(parse)?;
            merge(&mut merged, user);
            toml::Value::Table(merged).try_into().map_err(parse)
        }

        pub fn default_with_user_config_file(path: &Path) -> Result<Self, Error> {
            let display = path.display().to_string();
            let contents = std::fs::read_to_string(path).map_err(|err| Error::Read {
                path: display.clone(),
                err,
            })?;
            Self::default_with_user_config(&contents, &display)
        }
    }

    fn merge(base: &mut toml::Table, overlay: toml::Table) {
        for (key, value) in overlay {
            match (base.get_mut(&key), value) {
                (Some(toml::Value::Table(base)), toml::Value::Table(overlay)) => merge(base, overlay),
                (_, value) => {
                    base.insert(key, value);
                }
            }
        }
    }

    #[cfg(test)]
    pub mod test {
        use super::*;

        #[test]
        pub fn load_default_configuration() {
            let cfg = File::default();
            assert_eq!(cfg.description, Some("Default configuration file".into()));
            assert_eq!(cfg.base, "gcr.io/distroless/static:nonroot");
            assert_eq!(cfg.platforms, vec!["linux/amd64".to_string()]);
            assert_eq!(cfg.naming, Naming::Bare);
            assert!(!cfg.cache_failures);
            assert_eq!(cfg.sdk.go.build_docker_image, "golang:1-alpine");
        }

        #[test]
        fn user_config_overrides_defaults() {
            let cfg = File::default_with_user_config(
                "platforms = [\"linux/arm64\"]\nnaming = \"base\"\ncache_failures = true\n[sdk.go]\n",
                "sko.toml",
            )
            .unwrap();
            assert_eq!(cfg.platforms, vec!["linux/arm64".to_string()]);
            assert_eq!(cfg.naming, Naming::Base);
            assert!(cfg.cache_failures);
            assert_eq!(cfg.base, "gcr.io/distroless/static:nonroot");
            assert_eq!(cfg.sdk.go.build_docker_image, "golang:1-alpine");
        }

        #[test]
        fn invalid_user_config() {
            let err = File::default_with_user_config("naming = \"weird\"", "sko.toml").unwrap_err();
            assert!(matches!(err, Error::Parse { .. }));
        }

        #[test]
        fn missing_config_file() {
            let dir = tempfile::tempdir().unwrap();
            let err = File::default_with_user_config_file(&dir.path().join("nope.toml")).unwrap_err();
            assert!(matches!(err, Error::Read { .. }));
        }
    }
}

pub mod runtime {
    use std::path::PathBuf;

    use thiserror::Error;

    use super::file::File;
    use crate::image::{self, Platform};
    use crate::publish::Naming;
    use crate::reference::{self, Reference};

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("platform: {0}")]
        Platform(#[from] image::Error),

        #[error("no platforms to build for")]
        NoPlatforms,

        #[error("invalid base image {reference:?}: {cause}")]
        InvalidBase {
            reference: String,
            cause: reference::Error,
        },
    }

    /// Values supplied on the command line or through `SKO_*` variables.
    #[derive(Debug, Default, Clone)]
    pub struct Flags {
        pub image: String,
        pub import_path: String,
        pub tags: Vec<String>,
        pub local: bool,
        pub tar: Option<PathBuf>,
        pub base: Option<String>,
        pub platform: Option<String>,
        pub user: Option<String>,
        pub password: Option<String>,
        pub naming: Option<Naming>,
    }

    /// Ambient toolchain variables, read once by the caller.
    #[derive(Debug, Default, Clone)]
    pub struct Environment {
        pub goos: Option<String>,
        pub goarch: Option<String>,
    }

    impl Environment {
        pub fn from_process() -> Self {
            let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
            Self {
                goos: var("GOOS"),
                goarch: var("GOARCH"),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    pub enum Destination {
        Registry {
            username: Option<String>,
            password: Option<String>,
        },
        Daemon,
        Tarball(PathBuf),
    }

    /// Everything a run needs, fully resolved.
    #[derive(Debug, Clone)]
    pub struct Config {
        pub image: String,
        pub import_path: String,
        pub tags: Vec<String>,
        pub base: Reference,
        pub builder_image: String,
        pub platforms: Vec<Platform>,
        pub daemon_platform: Platform,
        pub naming: Naming,
        pub cache_failures: bool,
        pub destination: Destination,
    }

    impl Config {
        pub fn new(file: &File, flags: Flags, env: &Environment) -> Result<Self, Error> {
            let platforms = match &flags.platform {
                Some(platform) => Platform::parse_list(platform)?,
                None => file
                    .platforms
                    .iter()
                    .map(|p| p.parse())
                    .collect::<Result<Vec<_>, _>>()?,
            };
            if platforms.is_empty() {
                return Err(Error::NoPlatforms);
            }

            let base = flags.base.as_deref().unwrap_or(&file.base);
            let base = base.parse::<Reference>().map_err(|cause| Error::InvalidBase {
                reference: base.to_string(),
                cause,
            })?;

            let tags = if flags.tags.is_empty() {
                vec!["latest".to_string()]
            } else {
                flags.tags
            };

            let destination = match (flags.tar, flags.local) {
                (Some(path), _) => Destination::Tarball(path),
                (None, true) => Destination::Daemon,
                (None, false) => Destination::Registry {
                    username: flags.user,
                    password: flags.password,
                },
            };

            Ok(Self {
                image: flags.image,
                import_path: flags.import_path,
                tags,
                base,
                builder_image: file.sdk.go.build_docker_image.clone(),
                daemon_platform: daemon_platform(env, &platforms),
                platforms,
                naming: flags.naming.unwrap_or(file.naming),
                cache_failures: file.cache_failures,
                destination,
            })
        }
    }

    /// Platform picked out of a collection for the local daemon. Each field falls back from the
    /// toolchain variable to the first build platform.
    pub fn daemon_platform(env: &Environment, platforms: &[Platform]) -> Platform {
        let first = platforms.first().cloned().unwrap_or_default();
        Platform::new(
            env.goos.clone().unwrap_or(first.os),
            env.goarch.clone().unwrap_or(first.architecture),
        )
    }

}
