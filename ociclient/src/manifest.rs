use std::str::FromStr;

use bytes::Bytes;
use reqwest::Method;
use reqwest::header::{self, HeaderMap, HeaderValue};
use tracing::{info, warn};

use crate::blob::PushedBlob;
use crate::digest::OciDigest;
use crate::error::{Error, Result};
use crate::models::{Descriptor, ImageManifest, media_types};
use crate::transport::Transport;

const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

/// Builds image manifests from pushed blobs and publishes them under a tag.
pub struct ManifestPublisher<'a> {
    transport: &'a Transport,
}

impl<'a> ManifestPublisher<'a> {
    pub fn new(transport: &'a Transport) -> Self {
        Self { transport }
    }

    /// Manifest for `config` and `layers`, keeping layer order.
    ///
    /// Each layer's media type follows its content: gzip magic means a
    /// compressed tar, anything else a plain tar.
    pub fn build(config: &PushedBlob, layers: &[PushedBlob]) -> ImageManifest {
        ImageManifest {
            schema_version: 2,
            media_type: media_types::MANIFEST_V2.to_string(),
            config: Descriptor {
                media_type: media_types::CONTAINER_CONFIG.to_string(),
                size: config.size,
                digest: config.digest.clone(),
            },
            layers: layers
                .iter()
                .map(|layer| Descriptor {
                    media_type: if layer.gzip {
                        media_types::LAYER_TAR_GZIP
                    } else {
                        media_types::LAYER_TAR
                    }
                    .to_string(),
                    size: layer.size,
                    digest: layer.digest.clone(),
                })
                .collect(),
        }
    }

    /// `PUT` the manifest at `repository:tag`, returning its digest.
    pub async fn publish(
        &self,
        repository: &str,
        tag: &str,
        manifest: &ImageManifest,
    ) -> Result<OciDigest> {
        let wrap = |source: Error| Error::ManifestPush {
            repository: repository.to_string(),
            tag: tag.to_string(),
            source: Box::new(source),
        };

        // Serialized once so the length and digest describe exactly what is sent.
        let body = Bytes::from(serde_json::to_vec(manifest).map_err(|e| wrap(e.into()))?);
        let local_digest = OciDigest::sha256(&body);

        let mut headers = HeaderMap::new();
        let content_type = HeaderValue::from_str(&manifest.media_type)
            .unwrap_or_else(|_| HeaderValue::from_static(media_types::MANIFEST_V2));
        headers.insert(header::CONTENT_TYPE, content_type);
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));

        let path = format!("/v2/{}/manifests/{}", repository, tag);
        let response = self
            .transport
            .execute(Method::PUT, &path, Some(body), headers)
            .await
            .map_err(wrap)?;

        let remote_digest = response
            .headers()
            .get(DOCKER_CONTENT_DIGEST)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| OciDigest::from_str(value).ok());

        let digest = match remote_digest {
            Some(remote) if remote != local_digest => {
                warn!(
                    local = %local_digest,
                    remote = %remote,
                    "Registry reports a different manifest digest"
                );
                remote
            }
            Some(remote) => remote,
            None => local_digest,
        };

        info!(repository, tag, %digest, layers = manifest.layers.len(), "Published manifest");
        Ok(digest)
    }
}
