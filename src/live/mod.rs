// src/live/mod.rs

//! Live update orchestration.
//!
//! The `LiveUpdateManager` drives one reconciliation: detect changes,
//! classify the aggregate, snapshot state, dispatch each change to the
//! system mutator or service reloader, and aggregate the outcome. Each
//! invocation walks the phase machine
//!
//! ```text
//! Idle -> Detecting -> Planning -> (Applying | Refused) -> Completed
//! ```
//!
//! Guarantees:
//!
//! - Refusal performs no mutation of any kind and takes no snapshot
//! - Exactly one snapshot is created strictly before the first mutation
//! - Changes apply sequentially in detector order; the first failure stops
//!   the run, and already-applied changes are never auto-undone
//! - Reboot-required changes are either refused up front or reported as
//!   pending, never silently dropped

use crate::config::{AutomationConfig, Repository, ServiceConfig, SystemConfig, UserConfig};
use crate::detect::{detect_changes, ChangeKind, ConfigChange, UpdateStrategy};
use crate::error::{Error, Result};
use crate::mutate::SystemMutator;
use crate::notify::UpdateNotifier;
use crate::reload::{ReloadResult, ServiceReloader};
use crate::state::StateSyncManager;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use strum_macros::Display;
use tracing::{debug, info};

/// Seconds budgeted per package touched by a change
const PACKAGE_SECS: u64 = 30;
/// Seconds budgeted per service-reload change
const RELOAD_SECS: u64 = 5;

/// Phases of one reconciliation invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum UpdatePhase {
    Idle,
    Detecting,
    Planning,
    Applying,
    Refused,
    Completed,
    RolledBack,
}

/// Options governing one live update
#[derive(Debug, Clone)]
pub struct LiveUpdateOptions {
    /// Apply live changes even when reboot-required changes are deferred
    pub allow_partial_update: bool,
    /// Log intended actions, perform no mutation and take no snapshot
    pub dry_run: bool,
}

impl Default for LiveUpdateOptions {
    fn default() -> Self {
        Self {
            allow_partial_update: true,
            dry_run: false,
        }
    }
}

/// Outcome of one reconciliation; exactly one variant per invocation
#[derive(Debug)]
pub enum LiveUpdateResult {
    /// All applicable changes applied; reboot-required ones are listed
    Success {
        applied: Vec<ConfigChange>,
        pending_reboot: Vec<ConfigChange>,
    },
    /// Refused up front: reboot-required changes present and partial
    /// updates disallowed; nothing was mutated
    RebootRequired { changes: Vec<ConfigChange> },
    /// A change failed; earlier changes remain in effect
    Failure {
        applied: Vec<ConfigChange>,
        failed: Box<ConfigChange>,
        error: Error,
    },
}

impl LiveUpdateResult {
    pub fn is_success(&self) -> bool {
        matches!(self, LiveUpdateResult::Success { .. })
    }
}

/// Read-only planning projection of a reconciliation
#[derive(Debug, Clone)]
pub struct LiveUpdateCapability {
    pub live_count: usize,
    pub reboot_count: usize,
    /// Planning estimate only, not a contract
    pub estimated_duration: Duration,
    /// True iff no reboot-required changes exist
    pub can_fully_update: bool,
}

/// Orchestrates live reconciliation between two configuration snapshots
pub struct LiveUpdateManager {
    mutator: Arc<dyn SystemMutator>,
    reloader: Arc<dyn ServiceReloader>,
    state: Arc<dyn StateSyncManager>,
    notifier: Arc<dyn UpdateNotifier>,
}

impl LiveUpdateManager {
    pub fn new(
        mutator: Arc<dyn SystemMutator>,
        reloader: Arc<dyn ServiceReloader>,
        state: Arc<dyn StateSyncManager>,
        notifier: Arc<dyn UpdateNotifier>,
    ) -> Self {
        Self {
            mutator,
            reloader,
            state,
            notifier,
        }
    }

    /// Detection + classification only; never mutates
    pub fn can_apply_live_updates(
        &self,
        current: &SystemConfig,
        target: &SystemConfig,
    ) -> LiveUpdateCapability {
        let changes = detect_changes(current, target);
        let (live, reboot) = partition(&changes);

        LiveUpdateCapability {
            live_count: live.len(),
            reboot_count: reboot.len(),
            estimated_duration: estimate_duration(&live),
            can_fully_update: reboot.is_empty(),
        }
    }

    /// Run one full reconciliation
    pub fn apply_updates(
        &self,
        current: &SystemConfig,
        target: &SystemConfig,
        options: &LiveUpdateOptions,
    ) -> Result<LiveUpdateResult> {
        let mut phase = UpdatePhase::Idle;
        transition(&mut phase, UpdatePhase::Detecting);
        let changes = detect_changes(current, target);

        if changes.is_empty() {
            debug!("Configurations already converged, nothing to do");
            transition(&mut phase, UpdatePhase::Completed);
            return Ok(LiveUpdateResult::Success {
                applied: Vec::new(),
                pending_reboot: Vec::new(),
            });
        }

        transition(&mut phase, UpdatePhase::Planning);
        let (live, reboot) = partition(&changes);

        if !reboot.is_empty() && !options.allow_partial_update {
            // No mutation of any kind; nothing changed, nothing to roll back
            self.notifier.reboot_required(&changes);
            transition(&mut phase, UpdatePhase::Refused);
            return Ok(LiveUpdateResult::RebootRequired { changes });
        }

        if live.is_empty() {
            // Only deferred reboot changes remain
            self.notifier.reboot_required(&reboot);
            transition(&mut phase, UpdatePhase::Completed);
            return Ok(LiveUpdateResult::Success {
                applied: Vec::new(),
                pending_reboot: reboot,
            });
        }

        transition(&mut phase, UpdatePhase::Applying);
        self.notifier.update_starting(&live);

        if !options.dry_run {
            // Snapshot strictly before the first mutating call
            let snapshot = self.state.create_snapshot()?;
            info!("State snapshot {} created before update", snapshot.id);
        }

        let mut applied: Vec<ConfigChange> = Vec::new();
        for change in &live {
            match self.apply_change(change, options) {
                Ok(()) => {
                    self.notifier.change_applied(change);
                    applied.push(change.clone());
                }
                Err(error) => {
                    // Fail fast; applied changes stay in effect and the
                    // caller decides whether to restore the snapshot
                    self.notifier.change_failed(change, &error);
                    transition(&mut phase, UpdatePhase::Completed);
                    return Ok(LiveUpdateResult::Failure {
                        applied,
                        failed: Box::new(change.clone()),
                        error,
                    });
                }
            }
        }

        if !options.dry_run {
            self.state.sync_state(target)?;
        }
        self.notifier.update_completed(&applied, &reboot);
        transition(&mut phase, UpdatePhase::Completed);

        Ok(LiveUpdateResult::Success {
            applied,
            pending_reboot: reboot,
        })
    }

    /// Dispatch one live change to the mutator or reloader
    fn apply_change(&self, change: &ConfigChange, options: &LiveUpdateOptions) -> Result<()> {
        if options.dry_run {
            info!("dry-run: would apply {}", change.description);
            return Ok(());
        }

        match change.kind {
            ChangeKind::SystemField => {
                let value = string_value(&change.new_value, &change.description)?;
                match change.field.as_deref() {
                    Some("hostname") => self.mutator.set_hostname(&value),
                    Some("timezone") => self.mutator.set_timezone(&value),
                    Some("locale") => self.mutator.set_locale(&value),
                    other => Err(Error::Unexpected(format!(
                        "unhandled system field: {:?}",
                        other
                    ))),
                }
            }
            ChangeKind::PackageInstall => self.mutator.install_packages(&change.package_names()),
            ChangeKind::PackageRemove => self.mutator.remove_packages(&change.package_names()),
            ChangeKind::Repository => {
                if change.new_value.is_some() {
                    let repo: Repository = typed_value(&change.new_value, &change.description)?;
                    self.mutator.configure_repository(&repo)
                } else {
                    let repo: Repository = typed_value(&change.old_value, &change.description)?;
                    self.mutator.remove_repository(&repo.name)
                }
            }
            ChangeKind::UserAdd => {
                let user: UserConfig = typed_value(&change.new_value, &change.description)?;
                self.mutator.create_user(&user)
            }
            ChangeKind::UserModify => {
                let user: UserConfig = typed_value(&change.new_value, &change.description)?;
                self.mutator.modify_user(&user)
            }
            ChangeKind::UserRemove => {
                let user: UserConfig = typed_value(&change.old_value, &change.description)?;
                self.mutator.remove_user(&user.name)
            }
            ChangeKind::ServiceAdd | ChangeKind::ServiceConfig => {
                let service: ServiceConfig = typed_value(&change.new_value, &change.description)?;
                self.mutator.update_service_config(&service)?;
                match self.reloader.reload_service(&service.name, true) {
                    ReloadResult::Success { .. } => Ok(()),
                    ReloadResult::Failure { service, error } => Err(Error::Unexpected(format!(
                        "reload of '{}' failed: {}",
                        service, error
                    ))),
                }
            }
            ChangeKind::ServiceRemove => {
                let name = change
                    .affected_service
                    .as_deref()
                    .ok_or_else(|| Error::Unexpected("service change without name".to_string()))?;
                self.mutator.remove_service(name)
            }
            ChangeKind::DesktopConfig => {
                // Only parameter-level desktop changes are classified live
                let desktop = typed_value(&change.new_value, &change.description)?;
                self.mutator.apply_desktop_config(&desktop)
            }
            ChangeKind::Automation => {
                let automation: AutomationConfig = match &change.new_value {
                    Some(_) => typed_value(&change.new_value, &change.description)?,
                    None => AutomationConfig::default(),
                };
                self.mutator.apply_automation_config(&automation)
            }
        }
    }
}

/// Split into live-applicable and reboot-required, preserving order
fn partition(changes: &[ConfigChange]) -> (Vec<ConfigChange>, Vec<ConfigChange>) {
    let mut live = Vec::new();
    let mut reboot = Vec::new();
    for change in changes {
        match change.strategy {
            UpdateStrategy::RebootRequired => reboot.push(change.clone()),
            _ => live.push(change.clone()),
        }
    }
    (live, reboot)
}

/// Planning estimate: 30s per affected package, 5s per service reload,
/// nothing for pure field changes
pub fn estimate_duration(changes: &[ConfigChange]) -> Duration {
    let mut secs = 0u64;
    for change in changes {
        match change.kind {
            ChangeKind::PackageInstall | ChangeKind::PackageRemove => {
                secs += PACKAGE_SECS * change.package_names().len() as u64;
            }
            _ if change.strategy == UpdateStrategy::ServiceReload => {
                secs += RELOAD_SECS;
            }
            _ => {}
        }
    }
    Duration::from_secs(secs)
}

fn transition(phase: &mut UpdatePhase, next: UpdatePhase) {
    debug!("update phase {} -> {}", phase, next);
    *phase = next;
}

fn string_value(value: &Option<Value>, context: &str) -> Result<String> {
    value
        .as_ref()
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::Unexpected(format!("missing value for change '{}'", context)))
}

fn typed_value<T: DeserializeOwned>(value: &Option<Value>, context: &str) -> Result<T> {
    let value = value
        .as_ref()
        .ok_or_else(|| Error::Unexpected(format!("missing value for change '{}'", context)))?;
    serde_json::from_value(value.clone())
        .map_err(|e| Error::Unexpected(format!("malformed value for change '{}': {}", context, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::*;
    use crate::notify::SilentNotifier;
    use crate::reload::ReloadMethod;
    use crate::state::{StateSnapshot, SyncStatus};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Shared call log for ordering assertions across fakes
    type CallLog = Arc<Mutex<Vec<String>>>;

    struct FakeMutator {
        log: CallLog,
        fail_verb: Option<String>,
    }

    impl FakeMutator {
        fn record(&self, verb: &str) -> Result<()> {
            self.log.lock().unwrap().push(verb.to_string());
            if self.fail_verb.as_deref() == Some(verb) {
                return Err(Error::command_failed(verb, &[], "simulated failure"));
            }
            Ok(())
        }
    }

    impl SystemMutator for FakeMutator {
        fn set_hostname(&self, _: &str) -> Result<()> {
            self.record("set_hostname")
        }
        fn set_timezone(&self, _: &str) -> Result<()> {
            self.record("set_timezone")
        }
        fn set_locale(&self, _: &str) -> Result<()> {
            self.record("set_locale")
        }
        fn install_packages(&self, _: &[String]) -> Result<()> {
            self.record("install_packages")
        }
        fn remove_packages(&self, _: &[String]) -> Result<()> {
            self.record("remove_packages")
        }
        fn configure_repository(&self, _: &Repository) -> Result<()> {
            self.record("configure_repository")
        }
        fn remove_repository(&self, _: &str) -> Result<()> {
            self.record("remove_repository")
        }
        fn create_user(&self, _: &UserConfig) -> Result<()> {
            self.record("create_user")
        }
        fn modify_user(&self, _: &UserConfig) -> Result<()> {
            self.record("modify_user")
        }
        fn remove_user(&self, _: &str) -> Result<()> {
            self.record("remove_user")
        }
        fn update_service_config(&self, _: &ServiceConfig) -> Result<()> {
            self.record("update_service_config")
        }
        fn remove_service(&self, _: &str) -> Result<()> {
            self.record("remove_service")
        }
        fn apply_desktop_config(&self, _: &DesktopConfig) -> Result<()> {
            self.record("apply_desktop_config")
        }
        fn apply_automation_config(&self, _: &AutomationConfig) -> Result<()> {
            self.record("apply_automation_config")
        }
        fn has_required_permissions(&self) -> Result<bool> {
            Ok(true)
        }
        fn is_package_available(&self, _: &str) -> Result<bool> {
            Ok(true)
        }
    }

    struct FakeReloader {
        log: CallLog,
    }

    impl ServiceReloader for FakeReloader {
        fn reload_service(&self, name: &str, _graceful: bool) -> ReloadResult {
            self.log.lock().unwrap().push(format!("reload {}", name));
            ReloadResult::Success {
                service: name.to_string(),
                method: ReloadMethod::Signal,
            }
        }
    }

    struct FakeState {
        log: CallLog,
    }

    impl StateSyncManager for FakeState {
        fn sync_state(&self, _: &SystemConfig) -> Result<()> {
            self.log.lock().unwrap().push("sync_state".to_string());
            Ok(())
        }
        fn load_current(&self) -> Result<Option<SystemConfig>> {
            Ok(None)
        }
        fn create_snapshot(&self) -> Result<StateSnapshot> {
            self.log.lock().unwrap().push("create_snapshot".to_string());
            Ok(StateSnapshot {
                id: "test-snapshot".to_string(),
                timestamp: Utc::now(),
                config_path: "/tmp/c".into(),
                system_state_path: "/tmp/s".into(),
                service_state_path: "/tmp/v".into(),
                package_list_path: "/tmp/p".into(),
            })
        }
        fn list_snapshots(&self) -> Result<Vec<StateSnapshot>> {
            Ok(Vec::new())
        }
        fn restore_snapshot(&self, id: &str) -> Result<SystemConfig> {
            Err(Error::State(format!("no snapshot {}", id)))
        }
        fn check_sync(&self, _: &SystemConfig) -> Result<SyncStatus> {
            Ok(SyncStatus::NeverSynced)
        }
    }

    fn manager(log: &CallLog, fail_verb: Option<&str>) -> LiveUpdateManager {
        LiveUpdateManager::new(
            Arc::new(FakeMutator {
                log: log.clone(),
                fail_verb: fail_verb.map(|s| s.to_string()),
            }),
            Arc::new(FakeReloader { log: log.clone() }),
            Arc::new(FakeState { log: log.clone() }),
            Arc::new(SilentNotifier::new()),
        )
    }

    fn base_config() -> SystemConfig {
        let mut config = SystemConfig::new();
        config.hostname = "host".to_string();
        config.timezone = "UTC".to_string();
        config.locale = "en_US.UTF-8".to_string();
        config
    }

    fn plasma() -> DesktopConfig {
        DesktopConfig {
            environment: DesktopEnvironment::Plasma,
            auto_login: None,
            settings: BTreeMap::new(),
        }
    }

    #[test]
    fn test_hostname_change_applies_and_syncs() {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let manager = manager(&log, None);

        let current = base_config();
        let mut target = base_config();
        target.hostname = "new-host".to_string();

        let result = manager
            .apply_updates(&current, &target, &LiveUpdateOptions::default())
            .unwrap();

        match result {
            LiveUpdateResult::Success {
                applied,
                pending_reboot,
            } => {
                assert_eq!(applied.len(), 1);
                assert!(pending_reboot.is_empty());
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &["create_snapshot", "set_hostname", "sync_state"]
        );
    }

    #[test]
    fn test_refusal_performs_no_mutation_and_no_snapshot() {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let manager = manager(&log, None);

        let current = base_config();
        let mut target = base_config();
        target.hostname = "new-host".to_string();
        target.desktop = Some(plasma());

        let options = LiveUpdateOptions {
            allow_partial_update: false,
            dry_run: false,
        };
        let result = manager.apply_updates(&current, &target, &options).unwrap();

        match result {
            LiveUpdateResult::RebootRequired { changes } => {
                assert_eq!(changes.len(), 2);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_partial_update_defers_reboot_changes() {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let manager = manager(&log, None);

        let current = base_config();
        let mut target = base_config();
        target.hostname = "new-host".to_string();
        target.desktop = Some(plasma());

        let result = manager
            .apply_updates(&current, &target, &LiveUpdateOptions::default())
            .unwrap();

        match result {
            LiveUpdateResult::Success {
                applied,
                pending_reboot,
            } => {
                assert_eq!(applied.len(), 1);
                assert_eq!(pending_reboot.len(), 1);
                assert_eq!(pending_reboot[0].strategy, UpdateStrategy::RebootRequired);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_snapshot_taken_strictly_before_first_mutation() {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let manager = manager(&log, None);

        let current = base_config();
        let mut target = base_config();
        target.hostname = "new-host".to_string();
        target.packages.push(PackageSpec::install("git"));

        manager
            .apply_updates(&current, &target, &LiveUpdateOptions::default())
            .unwrap();

        let log = log.lock().unwrap();
        let snapshot_pos = log.iter().position(|c| c == "create_snapshot").unwrap();
        let first_mutation = log
            .iter()
            .position(|c| c == "set_hostname" || c == "install_packages")
            .unwrap();
        assert!(snapshot_pos < first_mutation);
        assert_eq!(log.iter().filter(|c| *c == "create_snapshot").count(), 1);
    }

    #[test]
    fn test_failure_stops_remaining_changes_without_undo() {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let manager = manager(&log, Some("install_packages"));

        let current = base_config();
        let mut target = base_config();
        target.hostname = "new-host".to_string();
        target.packages.push(PackageSpec::install("docker"));
        target.services.push(ServiceConfig::enabled("nginx"));

        let result = manager
            .apply_updates(&current, &target, &LiveUpdateOptions::default())
            .unwrap();

        match result {
            LiveUpdateResult::Failure {
                applied,
                failed,
                error,
            } => {
                // Hostname (change 1) applied and stays; install (change 2)
                // failed; service add (change 3) never attempted
                assert_eq!(applied.len(), 1);
                assert_eq!(applied[0].kind, ChangeKind::SystemField);
                assert_eq!(failed.kind, ChangeKind::PackageInstall);
                assert!(error.to_string().contains("simulated failure"));
            }
            other => panic!("unexpected: {:?}", other),
        }

        let log = log.lock().unwrap();
        assert!(!log.contains(&"update_service_config".to_string()));
        assert!(!log.contains(&"sync_state".to_string()));
    }

    #[test]
    fn test_converged_configs_are_a_noop() {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let manager = manager(&log, None);
        let config = base_config();

        let result = manager
            .apply_updates(&config, &config, &LiveUpdateOptions::default())
            .unwrap();

        assert!(result.is_success());
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_dry_run_mutates_nothing() {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let manager = manager(&log, None);

        let current = base_config();
        let mut target = base_config();
        target.hostname = "new-host".to_string();
        target.packages.push(PackageSpec::install("git"));

        let options = LiveUpdateOptions {
            allow_partial_update: true,
            dry_run: true,
        };
        let result = manager.apply_updates(&current, &target, &options).unwrap();

        match result {
            LiveUpdateResult::Success { applied, .. } => assert_eq!(applied.len(), 2),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_service_change_reloads_after_configuring() {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let manager = manager(&log, None);

        let current = base_config();
        let mut target = base_config();
        target.services.push(ServiceConfig::enabled("nginx"));

        manager
            .apply_updates(&current, &target, &LiveUpdateOptions::default())
            .unwrap();

        let log = log.lock().unwrap();
        let configure = log
            .iter()
            .position(|c| c == "update_service_config")
            .unwrap();
        let reload = log.iter().position(|c| c == "reload nginx").unwrap();
        assert!(configure < reload);
    }

    #[test]
    fn test_capability_estimates_duration() {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let manager = manager(&log, None);

        let current = base_config();
        let mut target = base_config();
        target.packages.push(PackageSpec::install("git"));
        target.packages.push(PackageSpec::install("docker"));
        target.services.push(ServiceConfig::enabled("nginx"));

        let capability = manager.can_apply_live_updates(&current, &target);
        assert_eq!(capability.live_count, 2);
        assert_eq!(capability.reboot_count, 0);
        assert!(capability.can_fully_update);
        // Two packages at 30s plus one service reload at 5s
        assert_eq!(capability.estimated_duration, Duration::from_secs(65));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_capability_flags_reboot_changes() {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let manager = manager(&log, None);

        let current = base_config();
        let mut target = base_config();
        target.desktop = Some(plasma());

        let capability = manager.can_apply_live_updates(&current, &target);
        assert_eq!(capability.reboot_count, 1);
        assert!(!capability.can_fully_update);
    }
}
