// tests/reconcile.rs

//! End-to-end reconciliation workflow tests.
//!
//! These run the full engine pipeline against a temp state root with a
//! dry-run command executor, so the deployment store, snapshots and
//! current-configuration marker are real files while external commands
//! are logged only.

use converge::exec::ShellExecutor;
use converge::{
    DesktopConfig, DesktopEnvironment, DirStateSync, EngineConfig, ExecutionEngine,
    ExecutionStatus, HostMutator, OstreeRepo, PackageSpec, ServiceConfig, SilentNotifier,
    StateSyncManager, SyncStatus, SystemConfig, SystemdReloader, UserConfig,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

fn engine(dir: &TempDir, dry_run: bool, allow_partial: bool) -> ExecutionEngine {
    let exec = Arc::new(ShellExecutor::new(true));
    let state = DirStateSync::new(dir.path().join("state"), exec.clone()).unwrap();
    let workflows_dir = state.workflows_dir();
    let state: Arc<dyn StateSyncManager> = Arc::new(state);
    ExecutionEngine::with_collaborators(
        EngineConfig {
            root: dir.path().to_path_buf(),
            dry_run,
            allow_partial_update: allow_partial,
        },
        Arc::new(HostMutator::new(exec.clone(), workflows_dir)),
        Arc::new(SystemdReloader::new(exec)),
        state,
        Arc::new(OstreeRepo::new(dir.path().join("repo")).unwrap()),
        Arc::new(SilentNotifier::new()),
    )
}

fn workstation() -> SystemConfig {
    let mut config = SystemConfig::new();
    config.hostname = "workstation".to_string();
    config.timezone = "America/New_York".to_string();
    config.locale = "en_US.UTF-8".to_string();
    config.packages.push(PackageSpec::install("git"));
    config.packages.push(PackageSpec::install("vim"));
    config.services.push(ServiceConfig::enabled("sshd"));
    config.users.push(UserConfig {
        name: "alice".to_string(),
        uid: Some(1000),
        shell: "/bin/bash".to_string(),
        groups: vec!["wheel".to_string()],
        home: None,
    });
    config
}

#[test]
fn test_first_apply_converges_from_empty_state() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, false, true);

    let result = engine.apply_configuration(&workstation()).unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert!(!result.applied.is_empty());
    assert!(result.pending_reboot.is_empty());

    // The commit is recorded, deployed, and the state marker matches
    let status = engine.status().unwrap();
    let commit = result.commit.unwrap();
    assert_eq!(status.pending_commit.as_deref(), Some(commit.id.as_str()));
    assert_eq!(status.sync, SyncStatus::InSync);

    // Exactly one snapshot was captured before mutation
    assert_eq!(engine.list_snapshots().unwrap().len(), 1);
}

#[test]
fn test_incremental_apply_only_touches_the_diff() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, false, true);
    engine.apply_configuration(&workstation()).unwrap();

    let mut updated = workstation();
    updated.packages.push(PackageSpec::install("docker"));

    let result = engine.apply_configuration(&updated).unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.applied.len(), 1);
    assert!(result.applied[0].description.contains("docker"));
}

#[test]
fn test_desktop_switch_defers_to_reboot() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, false, true);
    engine.apply_configuration(&workstation()).unwrap();

    let mut updated = workstation();
    updated.hostname = "workstation-2".to_string();
    updated.desktop = Some(DesktopConfig {
        environment: DesktopEnvironment::Gnome,
        auto_login: None,
        settings: BTreeMap::new(),
    });

    let result = engine.apply_configuration(&updated).unwrap();
    assert_eq!(result.status, ExecutionStatus::RebootPending);
    assert_eq!(result.applied.len(), 1);
    assert_eq!(result.pending_reboot.len(), 1);
}

#[test]
fn test_no_partial_refuses_mixed_update() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, false, false);
    engine.apply_configuration(&workstation()).unwrap();
    let snapshots_before = engine.list_snapshots().unwrap().len();

    let mut updated = workstation();
    updated.hostname = "workstation-2".to_string();
    updated.desktop = Some(DesktopConfig {
        environment: DesktopEnvironment::Sway,
        auto_login: None,
        settings: BTreeMap::new(),
    });

    let result = engine.apply_configuration(&updated).unwrap();
    assert_eq!(result.status, ExecutionStatus::Refused);
    assert!(result.applied.is_empty());

    // Refusal takes no snapshot and deploys nothing new
    assert_eq!(engine.list_snapshots().unwrap().len(), snapshots_before);
    let reapplied = engine.apply_configuration(&workstation()).unwrap();
    assert!(reapplied.applied.is_empty());
}

#[test]
fn test_history_and_rollback_round_trip() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, false, true);

    let first = engine.apply_configuration(&workstation()).unwrap();
    let first_commit = first.commit.unwrap();

    let mut updated = workstation();
    updated.hostname = "workstation-2".to_string();
    let second = engine.apply_configuration(&updated).unwrap();
    let second_commit = second.commit.unwrap();

    let history = engine.history().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, second_commit.id);
    assert_eq!(history[1].id, first_commit.id);
    assert_eq!(history[0].parent.as_deref(), Some(first_commit.id.as_str()));

    let info = engine.rollback_to(&first_commit.id).unwrap();
    assert_eq!(info.id, first_commit.id);
    assert_eq!(
        engine.status().unwrap().pending_commit.as_deref(),
        Some(first_commit.id.as_str())
    );
}

#[test]
fn test_plan_never_mutates_state() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, false, true);

    let changes = engine.plan(&workstation()).unwrap();
    assert!(!changes.is_empty());

    assert!(engine.history().unwrap().is_empty());
    assert!(engine.list_snapshots().unwrap().is_empty());
    assert_eq!(engine.status().unwrap().sync, SyncStatus::NeverSynced);
}

#[test]
fn test_dry_run_apply_leaves_no_trace() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, true, true);

    let result = engine.apply_configuration(&workstation()).unwrap();
    assert!(result.is_success());
    assert!(result.commit.is_none());

    assert!(engine.history().unwrap().is_empty());
    assert!(engine.list_snapshots().unwrap().is_empty());
}

#[test]
fn test_snapshot_restore_returns_recorded_config() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, false, true);
    engine.apply_configuration(&workstation()).unwrap();

    let snapshots = engine.list_snapshots().unwrap();
    assert_eq!(snapshots.len(), 1);

    // The snapshot was captured before the apply, so it records the
    // pre-update (empty) configuration
    let restored = engine.restore_snapshot(&snapshots[0].id).unwrap();
    assert!(restored.hostname.is_empty());
}
