// src/state/mod.rs

//! Durable state: the "current configuration" marker and state snapshots.
//!
//! Layout under the state root:
//!
//! ```text
//! current.json              last-applied configuration (atomic replace)
//! workflows/                one document per automation workflow
//! snapshots/<id>/           one set of artifacts per snapshot
//!     snapshot.json         snapshot record
//!     config.json           serialized configuration
//!     system.json           system facts at capture time
//!     services.json         service states at capture time
//!     packages.json         installed-package list at capture time
//! ```
//!
//! Snapshot creation stages all artifacts in a hidden temp directory and
//! renames it into place as a unit: an interrupted capture leaves nothing
//! visible to `list_snapshots`. Writes to `current.json` are
//! write-then-rename, so concurrent readers never observe a half-written
//! document.

use crate::config::SystemConfig;
use crate::error::{Error, Result};
use crate::exec::CommandExecutor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// File name of the current-configuration marker
const CURRENT_FILE: &str = "current.json";

/// A durable, point-in-time capture of configuration and system state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Unique, time-derived id
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub config_path: PathBuf,
    pub system_state_path: PathBuf,
    pub service_state_path: PathBuf,
    pub package_list_path: PathBuf,
}

/// Result of comparing the on-disk marker against a last-applied config
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    /// Marker matches the last-applied configuration
    InSync,
    /// Marker differs: something reconciled or edited state since
    Drift { detail: String },
    /// No configuration has ever been synced
    NeverSynced,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::InSync => write!(f, "in sync"),
            SyncStatus::Drift { detail } => write!(f, "drift ({})", detail),
            SyncStatus::NeverSynced => write!(f, "never synced"),
        }
    }
}

/// System facts captured into a snapshot
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SystemFacts {
    pub hostname: String,
    pub kernel: String,
    pub captured_at: Option<DateTime<Utc>>,
}

/// Persists the last-applied configuration and state snapshots
pub trait StateSyncManager: Send + Sync {
    /// Persist the given configuration as "current" (atomic replace)
    fn sync_state(&self, config: &SystemConfig) -> Result<()>;

    /// Load the current-configuration marker, if one exists
    fn load_current(&self) -> Result<Option<SystemConfig>>;

    /// Capture configuration, system facts, service states, and the
    /// installed-package list under a fresh snapshot id
    fn create_snapshot(&self) -> Result<StateSnapshot>;

    /// All snapshots, newest first
    fn list_snapshots(&self) -> Result<Vec<StateSnapshot>>;

    /// Make the named snapshot's configuration current again
    fn restore_snapshot(&self, id: &str) -> Result<SystemConfig>;

    /// Compare the on-disk marker against a last-applied configuration
    fn check_sync(&self, last_applied: &SystemConfig) -> Result<SyncStatus>;
}

/// Directory-backed state sync manager
pub struct DirStateSync {
    root: PathBuf,
    exec: Arc<dyn CommandExecutor>,
}

impl DirStateSync {
    pub fn new(root: impl Into<PathBuf>, exec: Arc<dyn CommandExecutor>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("snapshots"))?;
        fs::create_dir_all(root.join("workflows"))?;
        Ok(Self { root, exec })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding automation workflow documents
    pub fn workflows_dir(&self) -> PathBuf {
        self.root.join("workflows")
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    fn current_path(&self) -> PathBuf {
        self.root.join(CURRENT_FILE)
    }

    /// Capture system facts via external queries; failures degrade to empty
    /// fields so a snapshot can still be taken on a partially broken host
    fn capture_facts(&self) -> SystemFacts {
        let hostname = self
            .exec
            .run("hostname", &[])
            .map(|o| o.stdout.trim().to_string())
            .unwrap_or_default();
        let kernel = self
            .exec
            .run("uname", &["-r"])
            .map(|o| o.stdout.trim().to_string())
            .unwrap_or_default();
        SystemFacts {
            hostname,
            kernel,
            captured_at: Some(Utc::now()),
        }
    }

    fn capture_service_states(&self) -> Vec<String> {
        match self.exec.run(
            "systemctl",
            &["list-units", "--type=service", "--no-pager", "--no-legend"],
        ) {
            Ok(output) if output.success() => {
                output.stdout.lines().map(|l| l.trim().to_string()).collect()
            }
            _ => {
                warn!("Could not capture service states for snapshot");
                Vec::new()
            }
        }
    }

    fn capture_package_list(&self) -> Vec<String> {
        match self.exec.run("rpm", &["-qa"]) {
            Ok(output) if output.success() => {
                output.stdout.lines().map(|l| l.trim().to_string()).collect()
            }
            _ => {
                warn!("Could not capture package list for snapshot");
                Vec::new()
            }
        }
    }

    fn read_snapshot_record(&self, dir: &Path) -> Result<StateSnapshot> {
        let data = fs::read_to_string(dir.join("snapshot.json"))?;
        Ok(serde_json::from_str(&data)?)
    }
}

/// Atomic write: temp file in the same directory, fsync, rename
fn write_atomic(path: &Path, data: &str) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        use std::io::Write;
        file.write_all(data.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

impl StateSyncManager for DirStateSync {
    fn sync_state(&self, config: &SystemConfig) -> Result<()> {
        debug!("Syncing current configuration marker");
        write_atomic(&self.current_path(), &config.to_canonical_json()?)
    }

    fn load_current(&self) -> Result<Option<SystemConfig>> {
        let path = self.current_path();
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&data)?))
    }

    fn create_snapshot(&self) -> Result<StateSnapshot> {
        let timestamp = Utc::now();
        let id = format!(
            "{}-{}",
            timestamp.format("%Y%m%dT%H%M%S"),
            &Uuid::new_v4().to_string()[..8]
        );

        let final_dir = self.snapshots_dir().join(&id);
        let stage_dir = self.snapshots_dir().join(format!(".tmp-{}", id));
        fs::create_dir_all(&stage_dir)?;

        // Any artifact failure below abandons the staged directory, so no
        // partial snapshot ever becomes visible.
        let result = (|| -> Result<StateSnapshot> {
            let config = self.load_current()?.unwrap_or_default();
            let snapshot = StateSnapshot {
                id: id.clone(),
                timestamp,
                config_path: final_dir.join("config.json"),
                system_state_path: final_dir.join("system.json"),
                service_state_path: final_dir.join("services.json"),
                package_list_path: final_dir.join("packages.json"),
            };

            fs::write(stage_dir.join("config.json"), config.to_canonical_json()?)?;
            fs::write(
                stage_dir.join("system.json"),
                serde_json::to_string_pretty(&self.capture_facts())?,
            )?;
            fs::write(
                stage_dir.join("services.json"),
                serde_json::to_string_pretty(&self.capture_service_states())?,
            )?;
            fs::write(
                stage_dir.join("packages.json"),
                serde_json::to_string_pretty(&self.capture_package_list())?,
            )?;
            fs::write(
                stage_dir.join("snapshot.json"),
                serde_json::to_string_pretty(&snapshot)?,
            )?;

            Ok(snapshot)
        })();

        match result {
            Ok(snapshot) => {
                fs::rename(&stage_dir, &final_dir)?;
                info!("Created state snapshot {}", id);
                Ok(snapshot)
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&stage_dir);
                Err(e)
            }
        }
    }

    fn list_snapshots(&self) -> Result<Vec<StateSnapshot>> {
        let mut snapshots = Vec::new();
        for entry in fs::read_dir(self.snapshots_dir())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            // Hidden names are in-progress staging directories
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            match self.read_snapshot_record(&entry.path()) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!("Skipping unreadable snapshot {}: {}", name, e),
            }
        }
        snapshots.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(snapshots)
    }

    fn restore_snapshot(&self, id: &str) -> Result<SystemConfig> {
        let dir = self.snapshots_dir().join(id);
        if !dir.is_dir() {
            return Err(Error::State(format!("snapshot '{}' not found", id)));
        }
        let data = fs::read_to_string(dir.join("config.json"))?;
        let config: SystemConfig = serde_json::from_str(&data)?;
        self.sync_state(&config)?;
        info!("Restored configuration from snapshot {}", id);
        Ok(config)
    }

    fn check_sync(&self, last_applied: &SystemConfig) -> Result<SyncStatus> {
        match self.load_current()? {
            None => Ok(SyncStatus::NeverSynced),
            Some(current) if current == *last_applied => Ok(SyncStatus::InSync),
            Some(current) => {
                let mut details = Vec::new();
                if current.hostname != last_applied.hostname {
                    details.push("hostname");
                }
                if current.packages != last_applied.packages {
                    details.push("packages");
                }
                if current.services != last_applied.services {
                    details.push("services");
                }
                if current.users != last_applied.users {
                    details.push("users");
                }
                let detail = if details.is_empty() {
                    "configuration differs".to_string()
                } else {
                    format!("differs in: {}", details.join(", "))
                };
                Ok(SyncStatus::Drift { detail })
            }
        }
    }
}
