//! Persisted keeper state
//!
//! The keeper writes its state after every cycle so that a restarted
//! process resumes from the last reached state instead of `init`.

use crate::common::Result;
use crate::keeper::state::NodeState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

pub const STATE_FILE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeeperStateData {
    pub version: u32,
    pub node_id: i64,
    pub group_id: i32,
    pub current_state: NodeState,
    pub assigned_state: NodeState,
    #[serde(default)]
    pub last_monitor_contact: Option<DateTime<Utc>>,
    /// When synchronous replication was last switched on or off
    #[serde(default)]
    pub last_sync_rep_change: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sync_rep_disabled: bool,
}

impl Default for KeeperStateData {
    fn default() -> Self {
        Self {
            version: STATE_FILE_VERSION,
            node_id: -1,
            group_id: 0,
            current_state: NodeState::Init,
            assigned_state: NodeState::Init,
            last_monitor_contact: None,
            last_sync_rep_change: None,
            sync_rep_disabled: false,
        }
    }
}

/// Where the keeper state lives between runs.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// `None` when no state was ever written.
    async fn read_state(&self) -> Result<Option<KeeperStateData>>;

    async fn write_state(&self, state: &KeeperStateData) -> Result<()>;
}

/// JSON file, replaced atomically on every write.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn read_state(&self) -> Result<Option<KeeperStateData>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_state(&self, state: &KeeperStateData) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Wrote state file {}", self.path.display());
        Ok(())
    }
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    state: Arc<Mutex<Option<KeeperStateData>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: KeeperStateData) -> Self {
        Self {
            state: Arc::new(Mutex::new(Some(state))),
        }
    }

    /// Last written state.
    pub fn snapshot(&self) -> Option<KeeperStateData> {
        self.state.lock().ok().and_then(|s| s.clone())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn read_state(&self) -> Result<Option<KeeperStateData>> {
        Ok(self.snapshot())
    }

    async fn write_state(&self, state: &KeeperStateData) -> Result<()> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| crate::Error::Other("state store lock poisoned".into()))?;
        *guard = Some(state.clone());
        Ok(())
    }
}
