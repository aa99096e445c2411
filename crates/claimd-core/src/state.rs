//! Persisted scheduler state.
//!
//! A snapshot captures everything a restart must not lose: job backoff
//! progress, disabled jobs, proxy cooldown/burn windows and the challenge
//! ledger. [`JsonFileStore`] writes it atomically (temp file + rename).

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::challenge::ChallengeEntry;
use crate::error::AppError;
use crate::job::{DisabledJob, Job};
use crate::proxy_pool::ProxyEndpoint;
use crate::traits::StateStore;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub disabled: Vec<DisabledJob>,
    #[serde(default)]
    pub proxies: Vec<ProxyEndpoint>,
    #[serde(default)]
    pub challenges: Vec<ChallengeEntry>,
}

impl StateSnapshot {
    pub fn empty(saved_at: DateTime<Utc>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at,
            jobs: Vec::new(),
            disabled: Vec::new(),
            proxies: Vec::new(),
            challenges: Vec::new(),
        }
    }
}

/// Snapshot stored as pretty-printed JSON on disk.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StateStore for JsonFileStore {
    async fn load(&self) -> Result<Option<StateSnapshot>, AppError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot: StateSnapshot = serde_json::from_str(&raw)?;
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(AppError::StateError(format!(
                "State file {} has version {}, newest supported is {}",
                self.path.display(),
                snapshot.version,
                SNAPSHOT_VERSION
            )));
        }
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &StateSnapshot) -> Result<(), AppError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        tracing::debug!(path = %self.path.display(), jobs = snapshot.jobs.len(), "State saved");
        Ok(())
    }
}
