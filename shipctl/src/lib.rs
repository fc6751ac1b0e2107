pub mod config;
pub mod error;
pub mod lock;
pub mod orchestrator;
pub mod sink;
pub mod store;

pub use config::AppConfig;
pub use error::{DeployError, Result};
pub use lock::ServiceLocks;
pub use orchestrator::{
    DeploymentOutcome, DeploymentRequest, Orchestrator, OrchestratorOptions, Stage,
};
pub use sink::{LogLevel, LogNotifier, LogSink, NotificationKind, Notifier, TracingSink};
pub use store::{ConfigStore, FileConfigStore, State, StoredCredentials};
