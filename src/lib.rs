// src/lib.rs

//! Converge
//!
//! Declarative OS configuration manager with live updates, state
//! snapshots, and atomic versioned deployments.
//!
//! # Architecture
//!
//! - Declarative: one `SystemConfig` document describes the whole system
//! - Reconciliation: `detect_changes` diffs current vs target into an
//!   ordered, classified change list
//! - Live-first: changes apply without a reboot where the classification
//!   allows it; the rest is deferred or refused
//! - Versioned: every apply lands as a content-addressed commit that can
//!   be rolled back to
//! - Recoverable: a state snapshot is captured before any mutation

pub mod config;
pub mod deploy;
pub mod detect;
pub mod engine;
mod error;
pub mod exec;
pub mod live;
pub mod mutate;
pub mod notify;
pub mod reload;
pub mod state;

pub use config::{
    AutomationConfig, DesktopConfig, DesktopEnvironment, PackageAction, PackageSpec, Repository,
    ServiceConfig, SystemConfig, UserConfig, Workflow, CONFIG_FORMAT_VERSION,
};
pub use deploy::{CommitInfo, DeploymentManager, OstreeRepo, DEFAULT_BRANCH};
pub use detect::{detect_changes, ChangeKind, ConfigChange, Impact, UpdateStrategy};
pub use engine::{
    EngineConfig, ExecutionEngine, ExecutionResult, ExecutionStatus, SystemStatus, DEFAULT_ROOT,
};
pub use error::{Error, Result};
pub use live::{
    estimate_duration, LiveUpdateCapability, LiveUpdateManager, LiveUpdateOptions,
    LiveUpdateResult, UpdatePhase,
};
pub use mutate::{HostMutator, SystemMutator};
pub use notify::{CallbackNotifier, LogNotifier, NotifyEvent, SilentNotifier, UpdateNotifier};
pub use reload::{ReloadMethod, ReloadResult, ServiceReloader, SystemdReloader};
pub use state::{DirStateSync, StateSnapshot, StateSyncManager, SyncStatus, SystemFacts};
