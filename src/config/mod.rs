// src/config/mod.rs

//! System configuration model.
//!
//! A `SystemConfig` is the immutable snapshot handed to the reconciliation
//! core by the authoring layer: a tree of system facts (hostname, packages,
//! services, users, ...) compared structurally and never mutated. The wire
//! format is a versioned JSON document.
//!
//! Collections that feed change detection use sorted containers so that
//! serialization and diffing are deterministic.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use strum_macros::Display;

/// Current version of the configuration document format
pub const CONFIG_FORMAT_VERSION: u32 = 1;

/// A complete desired-state description of one system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SystemConfig {
    /// Document format version
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub hostname: String,

    #[serde(default)]
    pub timezone: String,

    #[serde(default)]
    pub locale: String,

    #[serde(default)]
    pub packages: Vec<PackageSpec>,

    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    #[serde(default)]
    pub users: Vec<UserConfig>,

    #[serde(default)]
    pub repositories: Vec<Repository>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desktop: Option<DesktopConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automation: Option<AutomationConfig>,
}

fn default_version() -> u32 {
    CONFIG_FORMAT_VERSION
}

/// What should happen to a named package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PackageAction {
    Install,
    Remove,
}

/// One package entry in the configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSpec {
    pub name: String,
    pub action: PackageAction,
}

impl PackageSpec {
    pub fn install(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: PackageAction::Install,
        }
    }

    pub fn remove(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: PackageAction::Remove,
        }
    }
}

/// Desired state of one system service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub enabled: bool,

    /// Service-specific settings (opaque to the core, compared structurally)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
}

impl ServiceConfig {
    pub fn enabled(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            config: BTreeMap::new(),
        }
    }
}

/// Desired state of one user account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,

    #[serde(default = "default_shell")]
    pub shell: String,

    #[serde(default)]
    pub groups: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home: Option<String>,
}

fn default_shell() -> String {
    "/bin/bash".to_string()
}

/// A package repository the system should know about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    pub url: String,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Desktop environment identity
///
/// Switching environments replaces the whole graphical stack and always
/// requires a reboot; changing parameters of an unchanged environment does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DesktopEnvironment {
    Plasma,
    Gnome,
    Sway,
    Xfce,
}

/// Desktop environment configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesktopConfig {
    pub environment: DesktopEnvironment,

    /// User to log in automatically, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_login: Option<String>,

    /// Environment parameters (theme, scaling, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: BTreeMap<String, String>,
}

/// Automation configuration: a set of named workflows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AutomationConfig {
    #[serde(default)]
    pub workflows: Vec<Workflow>,
}

/// One automation workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub enabled: bool,

    /// What fires the workflow (e.g. "boot", "daily", "on-update")
    #[serde(default)]
    pub trigger: String,

    #[serde(default)]
    pub actions: Vec<String>,
}

impl SystemConfig {
    /// Create an empty configuration with the current format version
    pub fn new() -> Self {
        Self {
            version: CONFIG_FORMAT_VERSION,
            ..Default::default()
        }
    }

    /// Look up a service by name
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Look up a user by name
    pub fn user(&self, name: &str) -> Option<&UserConfig> {
        self.users.iter().find(|u| u.name == name)
    }

    /// Look up a repository by name
    pub fn repository(&self, name: &str) -> Option<&Repository> {
        self.repositories.iter().find(|r| r.name == name)
    }

    /// Package names with the given action, sorted and deduplicated
    pub fn package_names(&self, action: PackageAction) -> Vec<String> {
        let mut names: Vec<String> = self
            .packages
            .iter()
            .filter(|p| p.action == action)
            .map(|p| p.name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Serialize to the canonical JSON document form
    ///
    /// Field order is fixed by the struct definition and maps use sorted
    /// keys, so equal configurations always produce identical bytes.
    pub fn to_canonical_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load a configuration document from disk
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        let config: SystemConfig = serde_json::from_str(&data)?;
        if config.version != CONFIG_FORMAT_VERSION {
            return Err(Error::InvalidConfig(format!(
                "unsupported configuration version {} (expected {})",
                config.version, CONFIG_FORMAT_VERSION
            )));
        }
        Ok(config)
    }

    /// Write the configuration document to disk (write-then-rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = self.to_canonical_json()?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_empty() {
        let config = SystemConfig::new();
        assert_eq!(config.version, CONFIG_FORMAT_VERSION);
        assert!(config.hostname.is_empty());
        assert!(config.packages.is_empty());
        assert!(config.desktop.is_none());
    }

    #[test]
    fn test_structural_equality() {
        let mut a = SystemConfig::new();
        a.hostname = "web01".to_string();
        a.packages.push(PackageSpec::install("nginx"));

        let mut b = SystemConfig::new();
        b.hostname = "web01".to_string();
        b.packages.push(PackageSpec::install("nginx"));

        assert_eq!(a, b);

        b.hostname = "web02".to_string();
        assert_ne!(a, b);
    }

    #[test]
    fn test_package_names_sorted_and_deduplicated() {
        let mut config = SystemConfig::new();
        config.packages.push(PackageSpec::install("nginx"));
        config.packages.push(PackageSpec::install("git"));
        config.packages.push(PackageSpec::install("git"));
        config.packages.push(PackageSpec::remove("sendmail"));

        assert_eq!(config.package_names(PackageAction::Install), vec!["git", "nginx"]);
        assert_eq!(config.package_names(PackageAction::Remove), vec!["sendmail"]);
    }

    #[test]
    fn test_canonical_json_is_deterministic() {
        let mut config = SystemConfig::new();
        config.hostname = "host".to_string();
        let mut svc = ServiceConfig::enabled("nginx");
        svc.config.insert("worker_processes".to_string(), "4".to_string());
        svc.config.insert("access_log".to_string(), "off".to_string());
        config.services.push(svc);

        let a = config.to_canonical_json().unwrap();
        let b = config.clone().to_canonical_json().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_load_save_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("system.json");

        let mut config = SystemConfig::new();
        config.hostname = "web01".to_string();
        config.timezone = "Europe/Oslo".to_string();
        config.services.push(ServiceConfig::enabled("sshd"));
        config.desktop = Some(DesktopConfig {
            environment: DesktopEnvironment::Plasma,
            auto_login: None,
            settings: BTreeMap::new(),
        });

        config.save(&path).unwrap();
        let loaded = SystemConfig::load(&path).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_rejects_unknown_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("system.json");
        std::fs::write(&path, r#"{"version": 99, "hostname": "h"}"#).unwrap();

        let result = SystemConfig::load(&path);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
