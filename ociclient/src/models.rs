use serde::{Deserialize, Serialize};

use crate::digest::OciDigest;

pub mod media_types {
    pub const MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const CONTAINER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
    pub const LAYER_TAR_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
    pub const LAYER_TAR: &str = "application/vnd.docker.image.rootfs.diff.tar";
}

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Whether a buffer starts with the gzip magic number.
pub fn is_gzip(content: &[u8]) -> bool {
    content.starts_with(&GZIP_MAGIC)
}

/// Represents a descriptor for a content blob in a registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content
    pub media_type: String,
    /// Size of the referenced content in bytes
    pub size: u64,
    /// Digest of the referenced content
    pub digest: OciDigest,
}

/// Image manifest (schema version 2) binding a config blob and ordered layers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Schema version of the manifest
    pub schema_version: u32,
    /// Media type of the manifest
    pub media_type: String,
    /// Descriptor for the config blob
    pub config: Descriptor,
    /// Descriptors for the layer blobs, in application order
    pub layers: Vec<Descriptor>,
}

/// One image entry of a saved archive's `manifest.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ArchiveImage {
    /// Archive-relative path of the image config
    pub config: String,
    /// Tags recorded when the archive was saved
    #[serde(default)]
    pub repo_tags: Option<Vec<String>>,
    /// Archive-relative paths of the layers, base layer first
    pub layers: Vec<String>,
}
