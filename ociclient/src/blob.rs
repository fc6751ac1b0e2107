use std::path::Path;

use bytes::Bytes;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use tracing::{debug, info, warn};

use crate::digest::OciDigest;
use crate::error::{Error, Result};
use crate::models::is_gzip;
use crate::transport::Transport;

/// A blob known to be present in a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushedBlob {
    pub digest: OciDigest,
    pub size: u64,
    /// Content starts with the gzip magic number
    pub gzip: bool,
    /// The registry already had the blob, nothing was uploaded
    pub skipped: bool,
}

/// Uploads config and layer blobs with a single monolithic PUT each.
pub struct BlobPusher<'a> {
    transport: &'a Transport,
}

impl<'a> BlobPusher<'a> {
    pub fn new(transport: &'a Transport) -> Self {
        Self { transport }
    }

    /// Push the file at `path` to `repository` unless the registry has it already.
    pub async fn push(&self, repository: &str, path: &Path) -> Result<PushedBlob> {
        let content = Bytes::from(tokio::fs::read(path).await?);
        let digest = OciDigest::sha256(&content);
        let size = content.len() as u64;
        let gzip = is_gzip(&content);

        if self.exists(repository, &digest).await {
            info!(%digest, size, "Blob already present, skipping upload");
            return Ok(PushedBlob {
                digest,
                size,
                gzip,
                skipped: true,
            });
        }

        self.upload(repository, &digest, content)
            .await
            .map_err(|e| Error::blob_upload(&digest, e))?;

        info!(%digest, size, "Uploaded blob");
        Ok(PushedBlob {
            digest,
            size,
            gzip,
            skipped: false,
        })
    }

    /// `HEAD` the blob. Anything but a success counts as absent; statuses
    /// other than 404 are only worth a warning since some registries do not
    /// support the check.
    async fn exists(&self, repository: &str, digest: &OciDigest) -> bool {
        let path = format!("/v2/{}/blobs/{}", repository, digest);
        match self
            .transport
            .execute(Method::HEAD, &path, None, HeaderMap::new())
            .await
        {
            Ok(_) => true,
            Err(e) if e.status() == Some(StatusCode::NOT_FOUND) => {
                debug!(%digest, "Blob not present in registry");
                false
            }
            Err(e) => {
                warn!(%digest, error = %e, "Blob existence check failed, uploading anyway");
                false
            }
        }
    }

    async fn upload(&self, repository: &str, digest: &OciDigest, content: Bytes) -> Result<()> {
        let start_path = format!("/v2/{}/blobs/uploads/", repository);
        let start = self
            .transport
            .execute(Method::POST, &start_path, Some(Bytes::new()), HeaderMap::new())
            .await?;

        let location = start
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(Error::MissingHeader("Location"))?;

        let mut upload_url = self.transport.resolve(location)?;
        upload_url
            .query_pairs_mut()
            .append_pair("digest", &digest.to_string());
        debug!(%digest, url = %upload_url, "Completing monolithic upload");

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(content.len()));

        self.transport
            .execute(Method::PUT, upload_url.as_str(), Some(content), headers)
            .await?;
        Ok(())
    }
}
