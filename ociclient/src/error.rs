use reqwest::StatusCode;
use thiserror::Error;

use crate::digest::DigestError;
use crate::reference::ReferenceError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid image archive: {0}")]
    ArchiveFormat(String),

    #[error("registry request {method} {url} failed with {status}: {body}")]
    RegistryRequest {
        method: reqwest::Method,
        url: String,
        status: StatusCode,
        body: String,
    },

    #[error("failed to upload blob {digest}")]
    BlobUpload {
        digest: String,
        #[source]
        source: Box<Error>,
    },

    #[error("failed to push manifest {repository}:{tag}")]
    ManifestPush {
        repository: String,
        tag: String,
        #[source]
        source: Box<Error>,
    },

    #[error("registry response is missing the {0} header")]
    MissingHeader(&'static str),

    #[error("token request to {realm} failed: {reason}")]
    TokenRequest { realm: String, reason: String },

    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error(transparent)]
    Reference(#[from] ReferenceError),

    #[error(transparent)]
    Digest(#[from] DigestError),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    /// HTTP status of a failed registry request, looking through upload and
    /// manifest wrappers.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::RegistryRequest { status, .. } => Some(*status),
            Error::BlobUpload { source, .. } | Error::ManifestPush { source, .. } => source.status(),
            _ => None,
        }
    }

    pub(crate) fn blob_upload(digest: impl ToString, source: Error) -> Self {
        Error::BlobUpload {
            digest: digest.to_string(),
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
