use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per service name, created on first use.
///
/// Holding the guard for a service keeps other runs for the same service
/// waiting; runs for other services are unaffected.
#[derive(Debug, Default, Clone)]
pub struct ServiceLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl ServiceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, service: &str) -> OwnedMutexGuard<()> {
        // The map shard must be released before waiting on the service lock.
        let lock = self.locks.entry(service.to_string()).or_default().value().clone();
        lock.lock_owned().await
    }

    /// Number of services seen so far.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
