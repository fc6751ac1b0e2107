use std::env;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use gitops::WorkspaceOptions;
use ociclient::{PushOptions, TransportOptions};
use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub registry: RegistryConfig,
    pub git: GitConfig,
    pub timeouts: TimeoutConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryConfig {
    /// Default `host/repository` coordinate for pushes
    pub host: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitConfig {
    pub remote_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub branch: String,
    pub author_name: String,
    pub author_email: String,
    /// `0` clones the full history
    pub clone_depth: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    pub request_secs: u64,
    pub connect_secs: u64,
    pub pipeline_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    pub max_concurrent_layers: usize,
}

impl AppConfig {
    /// Load defaults, then config files, then `SHIPCTL_*` environment variables.
    ///
    /// `explicit` is a file named on the command line; unlike the well-known
    /// locations it must exist.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "dev".into());

        let mut builder = Config::builder()
            // Start with default values
            .set_default("git.branch", "main")?
            .set_default("git.author_name", "shipctl")?
            .set_default("git.author_email", "deploy@localhost")?
            .set_default("git.clone_depth", 1)?
            .set_default("timeouts.request_secs", 600)?
            .set_default("timeouts.connect_secs", 30)?
            .set_default("timeouts.pipeline_secs", 1800)?
            .set_default("upload.max_concurrent_layers", 1)?
            // Add configuration from files
            .add_source(File::with_name("/etc/shipctl/config").required(false))
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false));

        if let Some(path) = explicit {
            builder = builder.add_source(File::from(path).required(true));
        }

        // Environment variables such as SHIPCTL_GIT__REMOTE_URL
        builder = builder.add_source(
            Environment::with_prefix("SHIPCTL")
                .prefix_separator("_")
                .separator("__"),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            request_timeout: Duration::from_secs(self.timeouts.request_secs),
            connect_timeout: Duration::from_secs(self.timeouts.connect_secs),
        }
    }

    pub fn push_options(&self) -> PushOptions {
        PushOptions {
            max_concurrent_layers: self.upload.max_concurrent_layers.max(1),
        }
    }

    pub fn workspace_options(&self) -> WorkspaceOptions {
        WorkspaceOptions {
            branch: self.git.branch.clone(),
            depth: self.git.clone_depth.max(0),
            author_email: self.git.author_email.clone(),
        }
    }

    pub fn pipeline_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.pipeline_secs)
    }
}
