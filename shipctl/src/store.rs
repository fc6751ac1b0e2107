use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, create_dir_all};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DeployError, Result};

const STATE_FILE_NAME: &str = "state.json";
const APP_NAME: &str = "shipctl";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for StoredCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl From<StoredCredentials> for ociclient::Credentials {
    fn from(c: StoredCredentials) -> Self {
        ociclient::Credentials::new(c.username, c.password)
    }
}

impl From<StoredCredentials> for gitops::GitCredentials {
    fn from(c: StoredCredentials) -> Self {
        gitops::GitCredentials::new(c.username, c.password)
    }
}

/// Everything remembered between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub registry: Option<StoredCredentials>,
    #[serde(default)]
    pub git: Option<StoredCredentials>,
    /// Last tag deployed successfully, per service name
    #[serde(default)]
    pub last_tags: BTreeMap<String, String>,
}

/// Persistence for credentials and last-known tags.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<State>;

    fn save(&self, state: &State) -> Result<()>;

    fn last_tag(&self, service: &str) -> Result<Option<String>> {
        Ok(self.load()?.last_tags.get(service).cloned())
    }

    fn record_tag(&self, service: &str, tag: &str) -> Result<()> {
        let mut state = self.load()?;
        state.last_tags.insert(service.to_string(), tag.to_string());
        self.save(&state)
    }
}

/// A JSON state file, by default `<config dir>/shipctl/state.json`.
#[derive(Debug)]
pub struct FileConfigStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn default_location() -> Result<Self> {
        let dir = dirs::config_dir()
            .ok_or_else(|| DeployError::State("no user configuration directory".to_string()))?;
        Ok(Self::new(dir.join(APP_NAME).join(STATE_FILE_NAME)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> Result<State> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No state file yet");
            return Ok(State::default());
        }
        let reader = BufReader::new(File::open(&self.path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    fn save(&self, state: &State) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(&self.path)?);
        serde_json::to_writer_pretty(&mut writer, state)?;
        writer.flush()?;
        Ok(())
    }

    fn record_tag(&self, service: &str, tag: &str) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut state = self.load()?;
        state.last_tags.insert(service.to_string(), tag.to_string());
        self.save(&state)
    }
}
