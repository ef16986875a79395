//! Applied-state journal
//!
//! A single JSON document at `<state_dir>/last_state.json` recording the
//! last applied configuration, its version hash, and node health. Written
//! atomically (temp + rename) so a crash mid-write never leaves a partial
//! file. Load is lazy and memoized; every mutation rewrites the document.

use crate::model::PeerSpec;
use crate::AgentError;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{error, warn};

const STATE_SCHEMA_VERSION: &str = "2.1.0";

/// Persisted snapshot of the last applied configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedSnapshot {
    pub version: String,
    pub node_id: Option<u32>,
    pub node_name: Option<String>,
    pub last_update: String,
    pub config_version_hash: Option<String>,
    pub applied_config: AppliedConfig,
    #[serde(default)]
    pub health_status: serde_json::Value,
    pub rollback_snapshot: Option<RollbackSnapshot>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppliedConfig {
    #[serde(default)]
    pub peers: Vec<PeerSpec>,
    #[serde(default)]
    pub applied_at: Option<String>,
}

/// Hash of the configuration that the current one replaced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackSnapshot {
    pub previous_hash: Option<String>,
    pub created_at: String,
}

impl AppliedSnapshot {
    fn empty() -> Self {
        Self {
            version: STATE_SCHEMA_VERSION.to_string(),
            node_id: None,
            node_name: None,
            last_update: now_utc(),
            config_version_hash: None,
            applied_config: AppliedConfig::default(),
            health_status: serde_json::Value::Object(Default::default()),
            rollback_snapshot: None,
        }
    }
}

fn now_utc() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Store for the applied-state journal. The reconciliation loop is the
/// only writer; the operator API reads through clones.
pub struct StateStore {
    path: PathBuf,
    cached: Mutex<Option<AppliedSnapshot>>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut AppliedSnapshot) -> T) -> T {
        let mut guard = self.cached.lock();
        if guard.is_none() {
            *guard = Some(self.load_from_disk());
        }
        f(guard.as_mut().expect("state loaded above"))
    }

    fn load_from_disk(&self) -> AppliedSnapshot {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(state) => state,
                Err(e) => {
                    error!(path = %self.path.display(), error = %e, "corrupt state file, starting empty");
                    AppliedSnapshot::empty()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppliedSnapshot::empty(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read state file");
                AppliedSnapshot::empty()
            }
        }
    }

    fn save(&self, state: &mut AppliedSnapshot) -> Result<(), AgentError> {
        state.last_update = now_utc();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        let raw = serde_json::to_string_pretty(state)
            .map_err(|e| AgentError::Config(format!("state serialize: {e}")))?;
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Clone of the full snapshot.
    pub fn snapshot(&self) -> AppliedSnapshot {
        self.with_state(|s| s.clone())
    }

    pub fn config_hash(&self) -> Option<String> {
        self.with_state(|s| s.config_version_hash.clone())
    }

    pub fn applied_peers(&self) -> Vec<PeerSpec> {
        self.with_state(|s| s.applied_config.peers.clone())
    }

    pub fn node_id(&self) -> Option<u32> {
        self.with_state(|s| s.node_id)
    }

    pub fn set_identity(&self, node_id: u32, node_name: &str) -> Result<(), AgentError> {
        self.with_state(|s| {
            s.node_id = Some(node_id);
            s.node_name = Some(node_name.to_string());
            self.save(s)
        })
    }

    /// Commit a new applied configuration, capturing the previous hash
    /// when it overwrites a non-empty one.
    pub fn update_applied(&self, peers: &[PeerSpec], hash: &str) -> Result<(), AgentError> {
        self.with_state(|s| {
            if !s.applied_config.peers.is_empty() || s.config_version_hash.is_some() {
                s.rollback_snapshot = Some(RollbackSnapshot {
                    previous_hash: s.config_version_hash.clone(),
                    created_at: now_utc(),
                });
            }
            s.config_version_hash = Some(hash.to_string());
            s.applied_config = AppliedConfig {
                peers: peers.to_vec(),
                applied_at: Some(now_utc()),
            };
            self.save(s)
        })
    }

    pub fn update_health(&self, mut health: serde_json::Value) -> Result<(), AgentError> {
        if let Some(map) = health.as_object_mut() {
            map.insert("last_check".into(), serde_json::Value::String(now_utc()));
        }
        self.with_state(|s| {
            s.health_status = health;
            self.save(s)
        })
    }
}
