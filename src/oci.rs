//! OCI image layout handling.
//!
//! Builds produce an image layout directory (`oci-layout`, `index.json`, `blobs/`). This module
//! turns such a directory into a [`BuildResult`], and writes selected images back out as OCI
//! archives that `docker load` understands.

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::image::{self, BuildResult, CollectionEntry, Digest, ImageCollection, Layout, Platform, SingleImage};
use crate::reference::{Pointer, Reference};

pub const MEDIA_TYPE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
const MEDIA_TYPE_DOCKER_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

/// Full reference name, picked up by `docker load`.
const ANNOTATION_IMAGE_NAME: &str = "io.containerd.image.name";
const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("read {path}: {err}")]
    ReadFile { path: String, err: Arc<std::io::Error> },

    #[error("deserialize {path}: {err}")]
    Deserialize { path: String, err: String },

    #[error("image layout at {0} lists no manifests")]
    EmptyLayout(String),

    #[error(transparent)]
    Digest(#[from] image::Error),

    #[error("write archive: {0}")]
    WriteArchive(Arc<std::io::Error>),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DescriptorPlatform {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<DescriptorPlatform>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
}

#[derive(Deserialize, Debug)]
struct Manifest {
    #[serde(default, rename = "mediaType")]
    media_type: Option<String>,
    config: Descriptor,
    #[serde(default)]
    layers: Vec<Descriptor>,
}

fn read(path: &Path) -> Result<Vec<u8>, Error> {
    std::fs::read(path).map_err(|err| Error::ReadFile {
        path: path.display().to_string(),
        err: Arc::new(err),
    })
}

fn parse<T: for<'de> Deserialize<'de>>(path: &Path, bytes: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(bytes).map_err(|err| Error::Deserialize {
        path: path.display().to_string(),
        err: err.to_string(),
    })
}

fn is_index(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_INDEX || media_type == MEDIA_TYPE_DOCKER_LIST
}

fn collection_from(digest: Digest, index: Index, layout: Arc<Layout>) -> Result<BuildResult, Error> {
    let entries = index
        .manifests
        .into_iter()
        .map(|descriptor| {
            let (platform, variant) = match descriptor.platform {
                Some(p) => (Some(Platform::new(p.os, p.architecture)), p.variant),
                None => (None, None),
            };
            Ok(CollectionEntry {
                platform,
                variant,
                digest: descriptor.digest.parse()?,
            })
        })
        .collect::<Result<Vec<_>, Error>>()?;
    Ok(BuildResult::Collection(ImageCollection {
        digest,
        entries,
        layout,
    }))
}

/// Interpret an image layout directory.
///
/// A layout whose index names a single image manifest is a single image; one that names a
/// single nested index, or several manifests, is a collection.
pub fn read_layout(layout: Layout) -> Result<BuildResult, Error> {
    let index_path = layout.root().join("index.json");
    let bytes = read(&index_path)?;
    let index: Index = parse(&index_path, &bytes)?;
    let layout = Arc::new(layout);

    let nested: Option<Digest> = match index.manifests.as_slice() {
        [] => return Err(Error::EmptyLayout(layout.root().display().to_string())),
        [descriptor] if is_index(&descriptor.media_type) => Some(descriptor.digest.parse()?),
        [descriptor] => {
            return Ok(BuildResult::Image(SingleImage {
                digest: descriptor.digest.parse()?,
                layout,
            }))
        }
        _ => None,
    };

    match nested {
        Some(digest) => {
            let nested_path = layout.blob_path(&digest);
            let nested: Index = parse(&nested_path, &read(&nested_path)?)?;
            collection_from(digest, nested, layout)
        }
        None => {
            let digest = format!("sha256:{}", sha256::digest(bytes.as_slice())).parse()?;
            collection_from(digest, index, layout)
        }
    }
}

struct ArchiveWriter<W: Write> {
    tar: tar::Builder<W>,
    written: HashSet<Digest>,
}

impl<W: Write> ArchiveWriter<W> {
    fn blob(&mut self, layout: &Layout, digest: &Digest) -> Result<u64, Error> {
        let path = layout.blob_path(digest);
        let size = std::fs::metadata(&path)
            .map_err(|err| Error::ReadFile {
                path: path.display().to_string(),
                err: Arc::new(err),
            })?
            .len();
        if self.written.insert(digest.clone()) {
            self.tar
                .append_path_with_name(&path, format!("blobs/{}/{}", digest.algorithm(), digest.hex()))
                .map_err(|err| Error::WriteArchive(Arc::new(err)))?;
        }
        Ok(size)
    }

    fn file(&mut self, name: &str, data: &[u8]) -> Result<(), Error> {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        self.tar
            .append_data(&mut header, name, data)
            .map_err(|err| Error::WriteArchive(Arc::new(err)))
    }
}

/// Write `images` as an OCI archive, one index entry per reference.
///
/// Images may come from different layouts; blobs shared between them are written once.
pub fn write_archive<W: Write>(images: &[(SingleImage, Reference)], writer: W) -> Result<W, Error> {
    let mut archive = ArchiveWriter {
        tar: tar::Builder::new(writer),
        written: HashSet::new(),
    };

    let mut manifests = Vec::with_capacity(images.len());
    for (image, reference) in images {
        let manifest_path = image.layout.blob_path(&image.digest);
        let manifest: Manifest = parse(&manifest_path, &read(&manifest_path)?)?;

        let size = archive.blob(&image.layout, &image.digest)?;
        archive.blob(&image.layout, &manifest.config.digest.parse()?)?;
        for layer in &manifest.layers {
            archive.blob(&image.layout, &layer.digest.parse()?)?;
        }

        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_IMAGE_NAME.to_string(), reference.to_string());
        if let Pointer::Tag(tag) = reference.pointer() {
            annotations.insert(ANNOTATION_REF_NAME.to_string(), tag.clone());
        }
        manifests.push(Descriptor {
            media_type: manifest
                .media_type
                .unwrap_or_else(|| MEDIA_TYPE_MANIFEST.to_string()),
            digest: image.digest.to_string(),
            size,
            platform: None,
            annotations,
        });
    }

    let index = Index {
        schema_version: 2,
        media_type: Some(MEDIA_TYPE_INDEX.to_string()),
        manifests,
    };
    let index = serde_json::to_vec(&index).map_err(|err| Error::Deserialize {
        path: "index.json".to_string(),
        err: err.to_string(),
    })?;
    archive.file("oci-layout", br#"{"imageLayoutVersion":"1.0.0"}"#)?;
    archive.file("index.json", &index)?;

    archive
        .tar
        .into_inner()
        .map_err(|err| Error::WriteArchive(Arc::new(err)))
}

#[cfg(test)]
pub mod tests {
    use std::io::Read;

    use super::*;

    pub fn put_blob(root: &Path, data: &[u8]) -> Digest {
        let hex = sha256::digest(data);
        let dir = root.join("blobs").join("sha256");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(&hex), data).unwrap();
        format!("sha256:{hex}").parse().unwrap()
    }

    /// Write a minimal image (config, one layer, manifest) and return the manifest digest.
    pub fn put_image(root: &Path, seed: &str) -> Digest {
        let config = put_blob(root, format!(r#"{{"seed":"{seed}"}}"#).as_bytes());
        let layer = put_blob(root, format!("layer-{seed}").as_bytes());
        let manifest = format!(
            r#"{{"schemaVersion":2,"mediaType":"{MEDIA_TYPE_MANIFEST}","config":{{"mediaType":"application/vnd.oci.image.config.v1+json","digest":"{config}","size":1}},"layers":[{{"mediaType":"application/vnd.oci.image.layer.v1.tar+gzip","digest":"{layer}","size":1}}]}}"#
        );
        put_blob(root, manifest.as_bytes())
    }

    fn descriptor(media_type: &str, digest: &Digest, platform: Option<&str>) -> String {
        let platform = platform
            .map(|p| {
                let mut parts = p.split('/');
                let (os, arch) = (parts.next().unwrap(), parts.next().unwrap());
                let variant = parts
                    .next()
                    .map(|v| format!(r#","variant":"{v}""#))
                    .unwrap_or_default();
                format!(r#","platform":{{"os":"{os}","architecture":"{arch}"{variant}}}"#)
            })
            .unwrap_or_default();
        format!(r#"{{"mediaType":"{media_type}","digest":"{digest}","size":1{platform}}}"#)
    }

    fn put_index(root: &Path, manifests: &[String]) {
        let index = format!(r#"{{"schemaVersion":2,"manifests":[{}]}}"#, manifests.join(","));
        std::fs::write(root.join("index.json"), index).unwrap();
    }

    #[test]
    fn single_image_layout() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = put_image(dir.path(), "a");
        put_index(dir.path(), &[descriptor(MEDIA_TYPE_MANIFEST, &manifest, None)]);

        match read_layout(Layout::at(dir.path())).unwrap() {
            BuildResult::Image(image) => assert_eq!(image.digest, manifest),
            other => panic!("expected an image, got {other:?}"),
        }
    }

    #[test]
    fn nested_index_layout() {
        let dir = tempfile::tempdir().unwrap();
        let amd64 = put_image(dir.path(), "amd64");
        let arm64 = put_image(dir.path(), "arm64");
        let nested = format!(
            r#"{{"schemaVersion":2,"mediaType":"{MEDIA_TYPE_INDEX}","manifests":[{},{}]}}"#,
            descriptor(MEDIA_TYPE_MANIFEST, &amd64, Some("linux/amd64")),
            descriptor(MEDIA_TYPE_MANIFEST, &arm64, Some("linux/arm64")),
        );
        let nested = put_blob(dir.path(), nested.as_bytes());
        put_index(dir.path(), &[descriptor(MEDIA_TYPE_INDEX, &nested, None)]);

        match read_layout(Layout::at(dir.path())).unwrap() {
            BuildResult::Collection(collection) => {
                assert_eq!(collection.digest, nested);
                assert_eq!(
                    collection.entries,
                    vec![
                        CollectionEntry {
                            platform: Some(Platform::new("linux", "amd64")),
                            variant: None,
                            digest: amd64,
                        },
                        CollectionEntry {
                            platform: Some(Platform::new("linux", "arm64")),
                            variant: None,
                            digest: arm64,
                        },
                    ]
                );
            }
            other => panic!("expected a collection, got {other:?}"),
        }
    }

    #[test]
    fn variants_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let v6 = put_image(dir.path(), "v6");
        let v7 = put_image(dir.path(), "v7");
        put_index(
            dir.path(),
            &[
                descriptor(MEDIA_TYPE_MANIFEST, &v6, Some("linux/arm/v6")),
                descriptor(MEDIA_TYPE_MANIFEST, &v7, Some("linux/arm/v7")),
            ],
        );

        match read_layout(Layout::at(dir.path())).unwrap() {
            BuildResult::Collection(collection) => {
                let variants: Vec<_> = collection.entries.iter().map(|e| e.variant.as_deref()).collect();
                assert_eq!(variants, vec![Some("v6"), Some("v7")]);
                assert!(collection
                    .entries
                    .iter()
                    .all(|e| e.platform == Some(Platform::new("linux", "arm"))));
            }
            other => panic!("expected a collection, got {other:?}"),
        }
    }

    #[test]
    fn empty_layout_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        put_index(dir.path(), &[]);
        assert!(matches!(
            read_layout(Layout::at(dir.path())),
            Err(Error::EmptyLayout(_))
        ));
    }

    #[test]
    fn missing_index_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read_layout(Layout::at(dir.path())),
            Err(Error::ReadFile { .. })
        ));
    }

    #[test]
    fn archive_annotates_references_and_dedups_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let digest = put_image(dir.path(), "a");
        let layout = Arc::new(Layout::at(dir.path()));
        let image = SingleImage { digest: digest.clone(), layout };
        let images = vec![
            (image.clone(), Reference::tag("example.com/app", "v1").unwrap()),
            (image, Reference::tag("example.com/app", "v2").unwrap()),
        ];

        let bytes = write_archive(&images, Vec::new()).unwrap();

        let mut names = Vec::new();
        let mut index = String::new();
        let mut archive = tar::Archive::new(bytes.as_slice());
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().display().to_string();
            if name == "index.json" {
                entry.read_to_string(&mut index).unwrap();
            }
            names.push(name);
        }

        // manifest, config and layer, once each, plus oci-layout and index.json
        assert_eq!(names.len(), 5);
        assert!(names.contains(&format!("blobs/sha256/{}", digest.hex())));

        let index: Index = serde_json::from_str(&index).unwrap();
        let refs: Vec<_> = index
            .manifests
            .iter()
            .map(|m| m.annotations[ANNOTATION_IMAGE_NAME].clone())
            .collect();
        assert_eq!(refs, vec!["example.com/app:v1", "example.com/app:v2"]);
        assert!(index.manifests.iter().all(|m| m.digest == digest.to_string()));
    }
}
