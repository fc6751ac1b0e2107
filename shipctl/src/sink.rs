use std::fmt;

use tracing::{debug, error, info, warn};

use crate::orchestrator::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

/// Receives progress for deployments, keyed by service name.
///
/// One sink is shared by every concurrent deployment.
pub trait LogSink: Send + Sync {
    fn emit(&self, service: &str, message: &str, level: LogLevel);

    /// Called when a deployment enters `stage`.
    fn stage(&self, service: &str, stage: Stage) {
        let _ = (service, stage);
    }
}

/// Forwards deployment progress to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, service: &str, message: &str, level: LogLevel) {
        match level {
            LogLevel::Debug => debug!(service, "{}", message),
            LogLevel::Info => info!(service, "{}", message),
            LogLevel::Warn => warn!(service, "{}", message),
            LogLevel::Error => error!(service, "{}", message),
        }
    }

    fn stage(&self, service: &str, stage: Stage) {
        debug!(service, %stage, "Entering stage");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Success,
    Failure,
}

/// Shown terminal outcomes of deployments.
pub trait Notifier: Send + Sync {
    fn show(&self, kind: NotificationKind, title: &str, message: &str);
}

/// Notifier for headless use: outcomes end up in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn show(&self, kind: NotificationKind, title: &str, message: &str) {
        match kind {
            NotificationKind::Success => info!(title, "{}", message),
            NotificationKind::Failure => error!(title, "{}", message),
        }
    }
}
