pub mod archive;
pub mod blob;
pub mod client;
pub mod digest;
pub mod error;
pub mod manifest;
pub mod models;
pub mod reference;
pub mod transport;

// Re-export main client types for convenience
pub use archive::ImageArchive;
pub use blob::{BlobPusher, PushedBlob};
pub use client::{PushOptions, PushOutcome, RegistryClient};
pub use digest::OciDigest;
pub use error::{Error, Result};
pub use manifest::ManifestPublisher;
pub use models::{ArchiveImage, Descriptor, ImageManifest};
pub use reference::{RepositoryCoordinate, validate_tag};
pub use transport::{AuthSession, BearerChallenge, Credentials, Transport, TransportOptions};
