use std::path::Path;

use futures::{StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use crate::archive::ImageArchive;
use crate::blob::{BlobPusher, PushedBlob};
use crate::digest::OciDigest;
use crate::error::Result;
use crate::manifest::ManifestPublisher;
use crate::models::ImageManifest;
use crate::transport::{Credentials, Transport, TransportOptions};

/// Tuning for image pushes.
#[derive(Debug, Clone)]
pub struct PushOptions {
    /// Layers uploaded at the same time. `1` pushes strictly in archive order.
    ///
    /// Each blob is held in memory for the length of its upload, so a push
    /// can hold up to this many whole layers at once.
    pub max_concurrent_layers: usize,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self {
            max_concurrent_layers: 1,
        }
    }
}

/// What a successful push left in the registry.
#[derive(Debug, Clone)]
pub struct PushOutcome {
    pub manifest_digest: OciDigest,
    pub manifest: ImageManifest,
    pub config: PushedBlob,
    pub layers: Vec<PushedBlob>,
}

impl PushOutcome {
    /// Number of blobs the registry already had.
    pub fn skipped_blobs(&self) -> usize {
        std::iter::once(&self.config)
            .chain(&self.layers)
            .filter(|blob| blob.skipped)
            .count()
    }
}

/// A client for pushing saved image archives to one registry.
pub struct RegistryClient {
    transport: Transport,
    options: PushOptions,
}

impl RegistryClient {
    pub fn new(transport: Transport, options: PushOptions) -> Self {
        Self { transport, options }
    }

    /// Connect to `host`, authenticating with `credentials` when given.
    pub async fn connect(
        host: &str,
        credentials: Option<&Credentials>,
        transport_options: &TransportOptions,
        options: PushOptions,
    ) -> Result<Self> {
        let transport = Transport::connect(host, credentials, transport_options).await?;
        Ok(Self::new(transport, options))
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Push the archive at `archive_path` as `repository:tag`.
    ///
    /// The config blob goes first, then every layer, then the manifest. The
    /// extraction directory is removed whether or not the push succeeds.
    pub async fn push_image(
        &self,
        archive_path: &Path,
        repository: &str,
        tag: &str,
    ) -> Result<PushOutcome> {
        let path = archive_path.to_path_buf();
        let archive = tokio::task::spawn_blocking(move || ImageArchive::open(&path)).await??;

        info!(
            repository,
            tag,
            layers = archive.layers().len(),
            saved_as = ?archive.repo_tags(),
            "Pushing image archive"
        );

        let result = self.push_archive(&archive, repository, tag).await;

        match tokio::task::spawn_blocking(move || archive.close()).await {
            Ok(Ok(())) => debug!("Removed archive extraction directory"),
            Ok(Err(e)) => warn!(error = %e, "Failed to remove archive extraction directory"),
            Err(e) => warn!(error = %e, "Archive cleanup task failed"),
        }

        result
    }

    async fn push_archive(
        &self,
        archive: &ImageArchive,
        repository: &str,
        tag: &str,
    ) -> Result<PushOutcome> {
        let pusher = BlobPusher::new(&self.transport);

        let config = pusher.push(repository, archive.config()).await?;

        // `buffered` yields results in input order, so the manifest keeps the
        // archive's layer order even when uploads overlap.
        // Built up front so the push future stays `Send`.
        let uploads: Vec<_> = archive
            .layers()
            .iter()
            .map(|layer| pusher.push(repository, layer))
            .collect();
        let layers: Vec<PushedBlob> = futures::stream::iter(uploads)
            .buffered(self.options.max_concurrent_layers.max(1))
            .try_collect()
            .await?;

        let manifest = ManifestPublisher::build(&config, &layers);
        let manifest_digest = ManifestPublisher::new(&self.transport)
            .publish(repository, tag, &manifest)
            .await?;

        Ok(PushOutcome {
            manifest_digest,
            manifest,
            config,
            layers,
        })
    }
}
