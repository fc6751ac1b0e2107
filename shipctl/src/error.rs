use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Debug, Diagnostic)]
pub enum DeployError {
    #[error(transparent)]
    #[diagnostic(code(shipctl::registry))]
    Registry(#[from] ociclient::Error),

    #[error(transparent)]
    #[diagnostic(code(shipctl::git))]
    Git(#[from] gitops::Error),

    #[error("deployment of {service} did not finish within {}s", timeout.as_secs())]
    #[diagnostic(
        code(shipctl::timeout),
        help("raise timeouts.pipeline_secs or check that the registry and git remote respond")
    )]
    Timeout { service: String, timeout: Duration },

    #[error("Configuration error: {0}")]
    #[diagnostic(code(shipctl::config))]
    Config(String),

    #[error("State file error: {0}")]
    #[diagnostic(code(shipctl::state))]
    State(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl DeployError {
    /// Short name of the failure, stable enough for log filters.
    pub fn kind(&self) -> &'static str {
        use gitops::Error as G;
        use ociclient::Error as O;

        match self {
            DeployError::Registry(e) => match e {
                O::ArchiveFormat(_) => "ArchiveFormat",
                O::BlobUpload { .. } => "BlobUpload",
                O::ManifestPush { .. } => "ManifestPush",
                O::Reference(_) => "InvalidReference",
                O::Digest(_) => "Digest",
                O::RegistryRequest { .. } | O::MissingHeader(_) | O::Http(_) => "RegistryRequest",
                O::TokenRequest { .. } => "TokenRequest",
                O::InvalidUrl { .. } => "InvalidUrl",
                O::Io(_) => "Io",
                O::Json(_) => "Json",
                O::Task(_) => "Task",
            },
            DeployError::Git(e) => match e {
                G::GitClone { .. } => "GitClone",
                G::GitPush { .. } => "GitPush",
                G::ManifestNotFound { .. } => "ManifestNotFound",
                G::ImageReferenceNotFound { .. } => "ImageReferenceNotFound",
                _ => "Git",
            },
            DeployError::Timeout { .. } => "Timeout",
            DeployError::Config(_) => "Config",
            DeployError::State(_) => "State",
            DeployError::Io(_) => "Io",
            DeployError::Task(_) => "Task",
        }
    }

    /// The error and all of its sources joined into one line.
    pub fn chain(&self) -> String {
        let mut message = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            let text = cause.to_string();
            if !message.ends_with(&text) {
                message.push_str(": ");
                message.push_str(&text);
            }
            source = cause.source();
        }
        message
    }
}

impl From<config::ConfigError> for DeployError {
    fn from(e: config::ConfigError) -> Self {
        DeployError::Config(e.to_string())
    }
}

impl From<serde_json::Error> for DeployError {
    fn from(e: serde_json::Error) -> Self {
        DeployError::State(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DeployError>;
