// src/engine/mod.rs

//! Top-level reconciliation engine.
//!
//! The `ExecutionEngine` wires the whole pipeline together: validate the
//! target configuration, take the system-wide lock, record a deployment
//! commit, run the live update, and mark the commit deployed. One engine
//! owns one state root (default `/var/lib/converge`).
//!
//! Apply pipeline:
//!
//! ```text
//! validate -> lock -> create commit -> live update -> deploy commit
//! ```
//!
//! The commit is created before any mutation so a failed run still leaves
//! a record of what was attempted, but it is only marked deployed after
//! every live change succeeded.

use crate::config::{PackageAction, SystemConfig};
use crate::deploy::{CommitInfo, DeploymentManager, OstreeRepo};
use crate::detect::{detect_changes, ConfigChange};
use crate::error::{Error, Result};
use crate::exec::ShellExecutor;
use crate::live::{LiveUpdateCapability, LiveUpdateManager, LiveUpdateOptions, LiveUpdateResult};
use crate::mutate::{HostMutator, SystemMutator};
use crate::notify::{LogNotifier, UpdateNotifier};
use crate::reload::{ServiceReloader, SystemdReloader};
use crate::state::{DirStateSync, StateSnapshot, StateSyncManager, SyncStatus};
use fs2::FileExt;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default state root owned by the engine
pub const DEFAULT_ROOT: &str = "/var/lib/converge";

/// Engine construction options
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// State root: deployment store, snapshots, lock file
    pub root: PathBuf,
    /// Log intended actions without mutating the system
    pub dry_run: bool,
    /// Apply live changes even when reboot-required changes are deferred
    pub allow_partial_update: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            dry_run: false,
            allow_partial_update: true,
        }
    }
}

/// Final status of one apply run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Every detected change was applied
    Completed,
    /// Live changes applied; some changes wait for the next boot
    RebootPending,
    /// Refused up front: reboot-required changes present and partial
    /// updates disallowed
    Refused,
    /// A change failed; earlier changes remain in effect
    Failed { description: String, error: String },
}

/// Outcome of one apply run
#[derive(Debug)]
pub struct ExecutionResult {
    /// Commit recorded for this run; `None` in dry-run mode
    pub commit: Option<CommitInfo>,
    pub applied: Vec<ConfigChange>,
    pub pending_reboot: Vec<ConfigChange>,
    pub status: ExecutionStatus,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        matches!(
            self.status,
            ExecutionStatus::Completed | ExecutionStatus::RebootPending
        )
    }
}

/// Point-in-time view of the managed system
#[derive(Debug)]
pub struct SystemStatus {
    pub current_commit: Option<String>,
    pub pending_commit: Option<String>,
    pub sync: SyncStatus,
    pub snapshot_count: usize,
}

/// Exclusive flock over the state root; released on drop
struct EngineLock {
    #[allow(dead_code)]
    file: File,
}

impl EngineLock {
    /// Retries with exponential backoff: 100ms, 200ms, 400ms, 800ms
    fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;

        const MAX_RETRIES: u32 = 5;
        let mut last_error = None;
        for attempt in 0..MAX_RETRIES {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    last_error = None;
                    break;
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt < MAX_RETRIES - 1 {
                        let delay = std::time::Duration::from_millis(100 * (1 << attempt));
                        debug!("State lock busy, retrying in {:?}", delay);
                        std::thread::sleep(delay);
                    }
                }
            }
        }
        if let Some(e) = last_error {
            return Err(Error::State(format!(
                "another update is in progress ({})",
                e
            )));
        }
        Ok(Self { file })
    }
}

impl Drop for EngineLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Drives full reconciliation runs against one state root
pub struct ExecutionEngine {
    config: EngineConfig,
    mutator: Arc<dyn SystemMutator>,
    state: Arc<dyn StateSyncManager>,
    deploy: Arc<dyn DeploymentManager>,
    live: LiveUpdateManager,
}

impl ExecutionEngine {
    /// Build an engine with host-backed collaborators
    pub fn new(config: EngineConfig) -> Result<Self> {
        let exec = Arc::new(ShellExecutor::new(config.dry_run));
        let state = DirStateSync::new(&config.root, exec.clone())?;
        let workflows_dir = state.workflows_dir();
        let state: Arc<dyn StateSyncManager> = Arc::new(state);
        let mutator: Arc<dyn SystemMutator> = Arc::new(HostMutator::new(exec.clone(), workflows_dir));
        let reloader: Arc<dyn ServiceReloader> = Arc::new(SystemdReloader::new(exec));
        let deploy: Arc<dyn DeploymentManager> =
            Arc::new(OstreeRepo::new(config.root.join("repo"))?);
        let notifier: Arc<dyn UpdateNotifier> = Arc::new(LogNotifier::new());
        Ok(Self::with_collaborators(
            config, mutator, reloader, state, deploy, notifier,
        ))
    }

    /// Build an engine from explicit collaborators
    pub fn with_collaborators(
        config: EngineConfig,
        mutator: Arc<dyn SystemMutator>,
        reloader: Arc<dyn ServiceReloader>,
        state: Arc<dyn StateSyncManager>,
        deploy: Arc<dyn DeploymentManager>,
        notifier: Arc<dyn UpdateNotifier>,
    ) -> Self {
        let live = LiveUpdateManager::new(
            mutator.clone(),
            reloader,
            state.clone(),
            notifier,
        );
        Self {
            config,
            mutator,
            state,
            deploy,
            live,
        }
    }

    fn lock_path(&self) -> PathBuf {
        self.config.root.join("lock")
    }

    /// Structural checks on a target configuration; never touches the system
    pub fn validate_configuration(&self, config: &SystemConfig) -> Result<()> {
        if config.hostname.trim().is_empty() {
            return Err(Error::InvalidConfig("hostname must not be empty".to_string()));
        }

        let mut services = BTreeSet::new();
        for service in &config.services {
            if !services.insert(service.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate service '{}'",
                    service.name
                )));
            }
        }

        let mut users = BTreeSet::new();
        for user in &config.users {
            if !users.insert(user.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate user '{}'",
                    user.name
                )));
            }
        }

        let mut repositories = BTreeSet::new();
        for repo in &config.repositories {
            if !repositories.insert(repo.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate repository '{}'",
                    repo.name
                )));
            }
        }

        let installs: BTreeSet<_> = config.package_names(PackageAction::Install).into_iter().collect();
        for name in config.package_names(PackageAction::Remove) {
            if installs.contains(&name) {
                return Err(Error::InvalidConfig(format!(
                    "package '{}' is marked for both install and removal",
                    name
                )));
            }
        }

        Ok(())
    }

    /// Last applied configuration, or an empty one before the first run
    fn current_configuration(&self) -> Result<SystemConfig> {
        Ok(self.state.load_current()?.unwrap_or_default())
    }

    /// Changes a reconciliation against `target` would apply; read-only
    pub fn plan(&self, target: &SystemConfig) -> Result<Vec<ConfigChange>> {
        self.validate_configuration(target)?;
        let current = self.current_configuration()?;
        Ok(detect_changes(&current, target))
    }

    /// Classification summary for a reconciliation; read-only
    pub fn can_reconcile(&self, target: &SystemConfig) -> Result<LiveUpdateCapability> {
        let current = self.current_configuration()?;
        Ok(self.live.can_apply_live_updates(&current, target))
    }

    /// Apply live changes against `target` without recording or deploying
    /// a commit; the state marker still advances on success
    pub fn reconcile(&self, target: &SystemConfig) -> Result<LiveUpdateResult> {
        self.validate_configuration(target)?;
        let _lock = EngineLock::acquire(&self.lock_path())?;
        let current = self.current_configuration()?;
        let options = LiveUpdateOptions {
            allow_partial_update: self.config.allow_partial_update,
            dry_run: self.config.dry_run,
        };
        self.live.apply_updates(&current, target, &options)
    }

    /// Run one full reconciliation against `target`
    pub fn apply_configuration(&self, target: &SystemConfig) -> Result<ExecutionResult> {
        self.validate_configuration(target)?;

        if !self.config.dry_run {
            if !self.mutator.has_required_permissions()? {
                return Err(Error::PermissionDenied(
                    "applying configuration requires root".to_string(),
                ));
            }
            for name in target.package_names(PackageAction::Install) {
                if !self.mutator.is_package_available(&name)? {
                    return Err(Error::PackageNotFound(name));
                }
            }
        }

        let _lock = EngineLock::acquire(&self.lock_path())?;
        let current = self.current_configuration()?;

        // Record the commit before mutating; deployment happens at the end
        let commit = if self.config.dry_run {
            None
        } else {
            let subject = format!("apply configuration for {}", target.hostname);
            let id = self.deploy.create_commit(target, &subject)?;
            Some(self.deploy.commit_info(&id)?)
        };

        let options = LiveUpdateOptions {
            allow_partial_update: self.config.allow_partial_update,
            dry_run: self.config.dry_run,
        };
        let outcome = self.live.apply_updates(&current, target, &options)?;

        let result = match outcome {
            LiveUpdateResult::Success {
                applied,
                pending_reboot,
            } => {
                if let Some(info) = &commit {
                    self.deploy.deploy_commit(&info.id)?;
                }
                let status = if pending_reboot.is_empty() {
                    info!("Configuration applied, system in sync");
                    ExecutionStatus::Completed
                } else {
                    warn!(
                        "Configuration applied, {} change(s) pending reboot",
                        pending_reboot.len()
                    );
                    ExecutionStatus::RebootPending
                };
                ExecutionResult {
                    commit,
                    applied,
                    pending_reboot,
                    status,
                }
            }
            LiveUpdateResult::RebootRequired { changes } => {
                warn!("Update refused: {} change(s) require a reboot", changes.len());
                ExecutionResult {
                    commit,
                    applied: Vec::new(),
                    pending_reboot: changes,
                    status: ExecutionStatus::Refused,
                }
            }
            LiveUpdateResult::Failure {
                applied,
                failed,
                error,
            } => ExecutionResult {
                commit,
                applied,
                pending_reboot: Vec::new(),
                status: ExecutionStatus::Failed {
                    description: failed.description.clone(),
                    error: error.to_string(),
                },
            },
        };

        Ok(result)
    }

    /// Mark an earlier commit for the next boot
    pub fn rollback_to(&self, commit_id: &str) -> Result<CommitInfo> {
        let _lock = EngineLock::acquire(&self.lock_path())?;
        self.deploy.rollback(commit_id)?;
        let info = self.deploy.commit_info(commit_id)?;
        info!("Rollback to commit {} staged for next boot", info.id);
        Ok(info)
    }

    /// Commit history, newest first
    pub fn history(&self) -> Result<Vec<CommitInfo>> {
        self.deploy.list_commits()
    }

    pub fn create_snapshot(&self) -> Result<StateSnapshot> {
        self.state.create_snapshot()
    }

    pub fn list_snapshots(&self) -> Result<Vec<StateSnapshot>> {
        self.state.list_snapshots()
    }

    /// Restore a snapshot's configuration record; the caller decides
    /// whether to reconcile against it afterwards
    pub fn restore_snapshot(&self, id: &str) -> Result<SystemConfig> {
        let _lock = EngineLock::acquire(&self.lock_path())?;
        self.state.restore_snapshot(id)
    }

    pub fn status(&self) -> Result<SystemStatus> {
        // Drift means the state marker no longer matches the deployed
        // commit, i.e. something reconciled or edited state out of band
        let sync = match self.deploy.pending_commit()? {
            Some(id) => {
                let committed = self.deploy.read_commit(&id)?;
                self.state.check_sync(&committed)?
            }
            None => match self.state.load_current()? {
                Some(_) => SyncStatus::InSync,
                None => SyncStatus::NeverSynced,
            },
        };
        Ok(SystemStatus {
            current_commit: self.deploy.current_commit()?,
            pending_commit: self.deploy.pending_commit()?,
            sync,
            snapshot_count: self.state.list_snapshots()?.len(),
        })
    }
}
