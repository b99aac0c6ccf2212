// src/mutate.rs

//! System mutation verbs.
//!
//! A thin imperative layer over the command executor: one verb per mutation
//! kind, stateless, idempotent-by-intent. Every verb either fully succeeds
//! (external command exit code 0) or fails with `CommandFailed` carrying the
//! captured output; no verb partially mutates and reports success.
//!
//! The pre-flight predicates (`has_required_permissions`,
//! `is_package_available`) are used by validation only, never by the
//! mutation verbs themselves.

use crate::config::{AutomationConfig, DesktopConfig, Repository, ServiceConfig, UserConfig};
use crate::error::Result;
use crate::exec::CommandExecutor;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Mutation verbs against the running system
pub trait SystemMutator: Send + Sync {
    fn set_hostname(&self, hostname: &str) -> Result<()>;
    fn set_timezone(&self, timezone: &str) -> Result<()>;
    fn set_locale(&self, locale: &str) -> Result<()>;
    fn install_packages(&self, packages: &[String]) -> Result<()>;
    fn remove_packages(&self, packages: &[String]) -> Result<()>;
    fn configure_repository(&self, repository: &Repository) -> Result<()>;
    fn remove_repository(&self, name: &str) -> Result<()>;
    fn create_user(&self, user: &UserConfig) -> Result<()>;
    fn modify_user(&self, user: &UserConfig) -> Result<()>;
    fn remove_user(&self, name: &str) -> Result<()>;
    fn update_service_config(&self, service: &ServiceConfig) -> Result<()>;
    fn remove_service(&self, name: &str) -> Result<()>;
    fn apply_desktop_config(&self, desktop: &DesktopConfig) -> Result<()>;
    fn apply_automation_config(&self, automation: &AutomationConfig) -> Result<()>;

    /// Pre-flight: does the caller have the privileges mutation needs?
    fn has_required_permissions(&self) -> Result<bool>;

    /// Pre-flight: is the package known to the package manager?
    fn is_package_available(&self, name: &str) -> Result<bool>;
}

/// Mutator for a systemd/dnf host
pub struct HostMutator {
    exec: Arc<dyn CommandExecutor>,
    /// Directory holding one document per automation workflow
    workflows_dir: PathBuf,
}

impl HostMutator {
    pub fn new(exec: Arc<dyn CommandExecutor>, workflows_dir: PathBuf) -> Self {
        Self {
            exec,
            workflows_dir,
        }
    }
}

impl SystemMutator for HostMutator {
    fn set_hostname(&self, hostname: &str) -> Result<()> {
        info!("Setting hostname to '{}'", hostname);
        self.exec
            .run_checked("hostnamectl", &["set-hostname", hostname])?;
        Ok(())
    }

    fn set_timezone(&self, timezone: &str) -> Result<()> {
        info!("Setting timezone to '{}'", timezone);
        self.exec
            .run_checked("timedatectl", &["set-timezone", timezone])?;
        Ok(())
    }

    fn set_locale(&self, locale: &str) -> Result<()> {
        info!("Setting locale to '{}'", locale);
        let lang = format!("LANG={}", locale);
        self.exec.run_checked("localectl", &["set-locale", &lang])?;
        Ok(())
    }

    fn install_packages(&self, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        info!("Installing packages: {}", packages.join(", "));
        let mut args = vec!["install", "-y"];
        args.extend(packages.iter().map(|p| p.as_str()));
        self.exec.run_checked("dnf", &args)?;
        Ok(())
    }

    fn remove_packages(&self, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        info!("Removing packages: {}", packages.join(", "));
        let mut args = vec!["remove", "-y"];
        args.extend(packages.iter().map(|p| p.as_str()));
        self.exec.run_checked("dnf", &args)?;
        Ok(())
    }

    fn configure_repository(&self, repository: &Repository) -> Result<()> {
        info!("Configuring repository '{}'", repository.name);
        self.exec.run_checked(
            "dnf",
            &["config-manager", "--add-repo", &repository.url],
        )?;
        if !repository.enabled {
            self.exec
                .run_checked("dnf", &["config-manager", "--set-disabled", &repository.name])?;
        }
        Ok(())
    }

    fn remove_repository(&self, name: &str) -> Result<()> {
        info!("Removing repository '{}'", name);
        let repo_file = format!("/etc/yum.repos.d/{}.repo", name);
        self.exec.run_checked("rm", &["-f", &repo_file])?;
        Ok(())
    }

    fn create_user(&self, user: &UserConfig) -> Result<()> {
        // Idempotent-by-intent: an existing account is modified instead
        if self.exec.run("id", &["-u", &user.name])?.success() && !self.exec.is_dry_run() {
            debug!("User '{}' already exists, modifying instead", user.name);
            return self.modify_user(user);
        }

        info!("Creating user '{}'", user.name);
        let uid;
        let groups;
        let mut args: Vec<&str> = vec!["-m", "-s", &user.shell];
        if let Some(u) = user.uid {
            uid = u.to_string();
            args.push("-u");
            args.push(&uid);
        }
        if !user.groups.is_empty() {
            groups = user.groups.join(",");
            args.push("-G");
            args.push(&groups);
        }
        if let Some(ref home) = user.home {
            args.push("-d");
            args.push(home);
        }
        args.push(&user.name);
        self.exec.run_checked("useradd", &args)?;
        Ok(())
    }

    fn modify_user(&self, user: &UserConfig) -> Result<()> {
        info!("Modifying user '{}'", user.name);
        let uid;
        let groups;
        let mut args: Vec<&str> = vec!["-s", &user.shell];
        if let Some(u) = user.uid {
            uid = u.to_string();
            args.push("-u");
            args.push(&uid);
        }
        if !user.groups.is_empty() {
            groups = user.groups.join(",");
            args.push("-G");
            args.push(&groups);
        }
        if let Some(ref home) = user.home {
            args.push("-d");
            args.push(home);
        }
        args.push(&user.name);
        self.exec.run_checked("usermod", &args)?;
        Ok(())
    }

    fn remove_user(&self, name: &str) -> Result<()> {
        info!("Removing user '{}'", name);
        self.exec.run_checked("userdel", &["-r", name])?;
        Ok(())
    }

    fn update_service_config(&self, service: &ServiceConfig) -> Result<()> {
        info!(
            "Configuring service '{}' (enabled: {})",
            service.name, service.enabled
        );
        if service.enabled {
            self.exec
                .run_checked("systemctl", &["enable", "--now", &service.name])?;
        } else {
            self.exec
                .run_checked("systemctl", &["disable", "--now", &service.name])?;
        }
        Ok(())
    }

    fn remove_service(&self, name: &str) -> Result<()> {
        info!("Removing service '{}'", name);
        self.exec
            .run_checked("systemctl", &["disable", "--now", name])?;
        Ok(())
    }

    fn apply_desktop_config(&self, desktop: &DesktopConfig) -> Result<()> {
        // Only parameter changes reach this verb; environment switches go
        // through the atomic deployment path.
        info!("Applying {} desktop settings", desktop.environment);
        self.exec
            .run_checked("systemctl", &["set-default", "graphical.target"])?;
        for (key, value) in &desktop.settings {
            debug!("desktop setting {} = {}", key, value);
        }
        Ok(())
    }

    fn apply_automation_config(&self, automation: &AutomationConfig) -> Result<()> {
        info!(
            "Applying automation config ({} workflows)",
            automation.workflows.len()
        );
        if self.exec.is_dry_run() {
            for workflow in &automation.workflows {
                info!("dry-run: would write workflow '{}'", workflow.name);
            }
            return Ok(());
        }

        fs::create_dir_all(&self.workflows_dir)?;

        // One document per workflow; stale documents are removed so the
        // directory always mirrors the configuration.
        let mut keep: Vec<String> = Vec::new();
        for workflow in &automation.workflows {
            let file_name = format!("{}.json", workflow.name);
            let path = self.workflows_dir.join(&file_name);
            let tmp = path.with_extension("tmp");
            fs::write(&tmp, serde_json::to_string_pretty(workflow)?)?;
            fs::rename(&tmp, &path)?;
            keep.push(file_name);
        }

        for entry in fs::read_dir(&self.workflows_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".json") && !keep.contains(&name) {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    fn has_required_permissions(&self) -> Result<bool> {
        // Nothing will be executed in dry-run mode, so nothing to deny
        if self.exec.is_dry_run() {
            return Ok(true);
        }
        let output = self.exec.run("id", &["-u"])?;
        Ok(output.success() && output.stdout.trim() == "0")
    }

    fn is_package_available(&self, name: &str) -> Result<bool> {
        let output = self.exec.run("dnf", &["info", name])?;
        Ok(output.success())
    }
}
