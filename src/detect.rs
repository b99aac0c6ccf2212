// src/detect.rs

//! Change detection between two configuration snapshots.
//!
//! `detect_changes` is a pure function from `(current, target)` to an ordered
//! change list. The ordering is dependency-respecting and stable:
//!
//! 1. system fields (hostname, timezone, locale)
//! 2. repositories
//! 3. package removals, then package installs
//! 4. users
//! 5. service removals, then service additions / config changes
//! 6. desktop
//! 7. automation
//!
//! Removals come before additions so a name reused with different
//! configuration never exists twice transiently.
//!
//! Each change carries an update strategy and impact derived solely from its
//! kind (desktop changes additionally distinguish environment identity from
//! parameter-only changes). They are never caller-supplied.

use crate::config::{PackageAction, SystemConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use strum_macros::Display;

/// Kind of one detected difference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ChangeKind {
    SystemField,
    Repository,
    PackageInstall,
    PackageRemove,
    UserAdd,
    UserModify,
    UserRemove,
    ServiceAdd,
    ServiceRemove,
    ServiceConfig,
    DesktopConfig,
    Automation,
}

/// How disruptively a change must be applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum UpdateStrategy {
    /// Apply on the running system, no service interruption
    Live,
    /// Apply on the running system, affected service reloads or restarts
    ServiceReload,
    /// Can only take effect through an atomic deployment and reboot
    RebootRequired,
}

/// How widely a change can affect the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Impact {
    Low,
    Medium,
    High,
    Critical,
}

/// One detected difference between current and target configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigChange {
    pub kind: ChangeKind,

    /// Which scalar field changed, for system-level changes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,

    /// Service name, when relevant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affected_service: Option<String>,

    pub description: String,
    pub strategy: UpdateStrategy,
    pub impact: Impact,
}

impl ConfigChange {
    /// Create a change with strategy and impact derived from its kind
    fn new(kind: ChangeKind, description: impl Into<String>) -> Self {
        let (strategy, impact) = classify(kind);
        Self {
            kind,
            field: None,
            old_value: None,
            new_value: None,
            affected_service: None,
            description: description.into(),
            strategy,
            impact,
        }
    }

    fn with_field(mut self, field: &str) -> Self {
        self.field = Some(field.to_string());
        self
    }

    fn with_values(mut self, old: Option<Value>, new: Option<Value>) -> Self {
        self.old_value = old;
        self.new_value = new;
        self
    }

    fn with_service(mut self, name: &str) -> Self {
        self.affected_service = Some(name.to_string());
        self
    }

    /// Desktop change: strategy depends on whether the environment identity
    /// itself changed, not only its parameters
    fn desktop(identity_changed: bool, description: impl Into<String>) -> Self {
        let mut change = Self::new(ChangeKind::DesktopConfig, description);
        if identity_changed {
            change.strategy = UpdateStrategy::RebootRequired;
            change.impact = Impact::Critical;
        }
        change
    }

    /// Automation change: impact is raised when an enabled, triggered
    /// workflow is affected
    fn automation(affects_triggered: bool, description: impl Into<String>) -> Self {
        let mut change = Self::new(ChangeKind::Automation, description);
        if affects_triggered {
            change.impact = Impact::Medium;
        }
        change
    }

    /// Package names carried by a package install/remove change
    pub fn package_names(&self) -> Vec<String> {
        let value = match self.kind {
            ChangeKind::PackageInstall => self.new_value.as_ref(),
            ChangeKind::PackageRemove => self.old_value.as_ref(),
            _ => None,
        };
        value
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Strategy and impact as a pure function of change kind
///
/// Desktop changes start from the parameter-only classification; the
/// identity case is handled in `ConfigChange::desktop`.
fn classify(kind: ChangeKind) -> (UpdateStrategy, Impact) {
    use ChangeKind::*;
    match kind {
        SystemField => (UpdateStrategy::Live, Impact::Low),
        Repository => (UpdateStrategy::Live, Impact::Medium),
        PackageInstall | PackageRemove => (UpdateStrategy::Live, Impact::Medium),
        UserAdd | UserModify | UserRemove => (UpdateStrategy::Live, Impact::Medium),
        ServiceAdd | ServiceRemove | ServiceConfig => (UpdateStrategy::ServiceReload, Impact::Medium),
        DesktopConfig => (UpdateStrategy::Live, Impact::Medium),
        Automation => (UpdateStrategy::Live, Impact::Low),
    }
}

/// Compute the ordered change list between two configuration snapshots
///
/// Pure and deterministic: no side effects, identical inputs always yield
/// identical ordered output, and `detect_changes(a, a)` is empty.
pub fn detect_changes(current: &SystemConfig, target: &SystemConfig) -> Vec<ConfigChange> {
    let mut changes = Vec::new();

    detect_system_fields(current, target, &mut changes);
    detect_repositories(current, target, &mut changes);
    detect_packages(current, target, &mut changes);
    detect_users(current, target, &mut changes);
    detect_services(current, target, &mut changes);
    detect_desktop(current, target, &mut changes);
    detect_automation(current, target, &mut changes);

    changes
}

fn detect_system_fields(current: &SystemConfig, target: &SystemConfig, changes: &mut Vec<ConfigChange>) {
    let fields = [
        ("hostname", &current.hostname, &target.hostname),
        ("timezone", &current.timezone, &target.timezone),
        ("locale", &current.locale, &target.locale),
    ];

    for (field, old, new) in fields {
        if old != new {
            changes.push(
                ConfigChange::new(
                    ChangeKind::SystemField,
                    format!("Set {} to '{}'", field, new),
                )
                .with_field(field)
                .with_values(
                    Some(Value::String(old.clone())),
                    Some(Value::String(new.clone())),
                ),
            );
        }
    }
}

fn detect_repositories(current: &SystemConfig, target: &SystemConfig, changes: &mut Vec<ConfigChange>) {
    let names: BTreeSet<&str> = current
        .repositories
        .iter()
        .chain(target.repositories.iter())
        .map(|r| r.name.as_str())
        .collect();

    for name in names {
        let old = current.repository(name);
        let new = target.repository(name);

        let description = match (old, new) {
            (None, Some(_)) => format!("Add repository {}", name),
            (Some(_), None) => format!("Remove repository {}", name),
            (Some(a), Some(b)) if a != b => format!("Update repository {}", name),
            _ => continue,
        };

        changes.push(
            ConfigChange::new(ChangeKind::Repository, description)
                .with_field(name)
                .with_values(
                    old.map(|r| serde_json::json!(r)),
                    new.map(|r| serde_json::json!(r)),
                ),
        );
    }
}

fn detect_packages(current: &SystemConfig, target: &SystemConfig, changes: &mut Vec<ConfigChange>) {
    let current_installed: BTreeSet<String> =
        current.package_names(PackageAction::Install).into_iter().collect();
    let target_installed: BTreeSet<String> =
        target.package_names(PackageAction::Install).into_iter().collect();

    // Removals: dropped from the install set, or explicitly marked for
    // removal in the target while still installed.
    let mut removals: BTreeSet<String> =
        current_installed.difference(&target_installed).cloned().collect();
    for name in target.package_names(PackageAction::Remove) {
        if current_installed.contains(&name) {
            removals.insert(name);
        }
    }

    let installs: Vec<String> = target_installed
        .difference(&current_installed)
        .cloned()
        .collect();

    // All affected packages aggregate into one change per direction,
    // removals first.
    if !removals.is_empty() {
        let removals: Vec<String> = removals.into_iter().collect();
        changes.push(
            ConfigChange::new(
                ChangeKind::PackageRemove,
                format!("Remove packages: {}", removals.join(", ")),
            )
            .with_values(Some(serde_json::json!(removals)), None),
        );
    }

    if !installs.is_empty() {
        changes.push(
            ConfigChange::new(
                ChangeKind::PackageInstall,
                format!("Install packages: {}", installs.join(", ")),
            )
            .with_values(None, Some(serde_json::json!(installs))),
        );
    }
}

fn detect_users(current: &SystemConfig, target: &SystemConfig, changes: &mut Vec<ConfigChange>) {
    let names: BTreeSet<&str> = current
        .users
        .iter()
        .chain(target.users.iter())
        .map(|u| u.name.as_str())
        .collect();

    // Removals first, then additions and modifications, each name-sorted.
    for name in &names {
        if let Some(old) = current.user(name) {
            if target.user(name).is_none() {
                changes.push(
                    ConfigChange::new(ChangeKind::UserRemove, format!("Remove user {}", name))
                        .with_values(Some(serde_json::json!(old)), None),
                );
            }
        }
    }

    for name in &names {
        match (current.user(name), target.user(name)) {
            (None, Some(new)) => changes.push(
                ConfigChange::new(ChangeKind::UserAdd, format!("Create user {}", name))
                    .with_values(None, Some(serde_json::json!(new))),
            ),
            (Some(old), Some(new)) if old != new => changes.push(
                ConfigChange::new(ChangeKind::UserModify, format!("Modify user {}", name))
                    .with_values(Some(serde_json::json!(old)), Some(serde_json::json!(new))),
            ),
            _ => {}
        }
    }
}

fn detect_services(current: &SystemConfig, target: &SystemConfig, changes: &mut Vec<ConfigChange>) {
    let names: BTreeSet<&str> = current
        .services
        .iter()
        .chain(target.services.iter())
        .map(|s| s.name.as_str())
        .collect();

    // Service removals before additions, so a reused name never exists with
    // two configurations at once.
    for name in &names {
        if current.service(name).is_some() && target.service(name).is_none() {
            let old = current.service(name);
            changes.push(
                ConfigChange::new(ChangeKind::ServiceRemove, format!("Remove service {}", name))
                    .with_service(name)
                    .with_values(old.map(|s| serde_json::json!(s)), None),
            );
        }
    }

    for name in &names {
        match (current.service(name), target.service(name)) {
            (None, Some(new)) => changes.push(
                ConfigChange::new(ChangeKind::ServiceAdd, format!("Add service {}", name))
                    .with_service(name)
                    .with_values(None, Some(serde_json::json!(new))),
            ),
            (Some(old), Some(new)) if old != new => changes.push(
                ConfigChange::new(
                    ChangeKind::ServiceConfig,
                    format!("Reconfigure service {}", name),
                )
                .with_service(name)
                .with_values(Some(serde_json::json!(old)), Some(serde_json::json!(new))),
            ),
            _ => {}
        }
    }
}

fn detect_desktop(current: &SystemConfig, target: &SystemConfig, changes: &mut Vec<ConfigChange>) {
    let (identity_changed, description) = match (&current.desktop, &target.desktop) {
        (None, None) => return,
        (Some(a), Some(b)) if a == b => return,
        (None, Some(b)) => (true, format!("Enable {} desktop environment", b.environment)),
        (Some(a), None) => (true, format!("Remove {} desktop environment", a.environment)),
        (Some(a), Some(b)) => {
            if a.environment != b.environment {
                (
                    true,
                    format!(
                        "Switch desktop environment {} -> {}",
                        a.environment, b.environment
                    ),
                )
            } else {
                (
                    false,
                    format!("Update {} desktop settings", b.environment),
                )
            }
        }
    };

    changes.push(ConfigChange::desktop(identity_changed, description).with_values(
        current.desktop.as_ref().map(|d| serde_json::json!(d)),
        target.desktop.as_ref().map(|d| serde_json::json!(d)),
    ));
}

fn detect_automation(current: &SystemConfig, target: &SystemConfig, changes: &mut Vec<ConfigChange>) {
    if current.automation == target.automation {
        return;
    }

    // A change to an enabled workflow with a trigger can fire on its own;
    // rank those above edits to disabled or untriggered workflows.
    let affects_triggered = current
        .automation
        .iter()
        .chain(target.automation.iter())
        .flat_map(|a| a.workflows.iter())
        .filter(|w| w.enabled && !w.trigger.is_empty())
        .any(|w| {
            let in_current = current
                .automation
                .as_ref()
                .and_then(|a| a.workflows.iter().find(|c| c.name == w.name));
            let in_target = target
                .automation
                .as_ref()
                .and_then(|a| a.workflows.iter().find(|t| t.name == w.name));
            in_current != in_target
        });

    changes.push(
        ConfigChange::automation(affects_triggered, "Update automation workflows").with_values(
            current.automation.as_ref().map(|a| serde_json::json!(a)),
            target.automation.as_ref().map(|a| serde_json::json!(a)),
        ),
    );
}
