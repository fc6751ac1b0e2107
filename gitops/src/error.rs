use std::path::PathBuf;

use thiserror::Error;

/// Failures while preparing or publishing a manifest change
#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to clone {url}: {source}")]
    GitClone {
        url: String,
        #[source]
        source: git2::Error,
    },

    #[error("Failed to commit {}: {source}", path.display())]
    GitCommit {
        path: PathBuf,
        #[source]
        source: git2::Error,
    },

    #[error("Failed to push {refspec} to {url}: {reason}")]
    GitPush {
        url: String,
        refspec: String,
        reason: String,
    },

    #[error("No manifest mentioning {identifier:?} found under {}", searched.display())]
    ManifestNotFound { identifier: String, searched: PathBuf },

    #[error("{} has no image reference for {identifier:?}", path.display())]
    ImageReferenceNotFound { path: PathBuf, identifier: String },

    #[error("Invalid image pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
