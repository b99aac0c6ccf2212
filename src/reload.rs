// src/reload.rs

//! Service reload dispatch.
//!
//! Given a service name and a graceful flag, picks a reload method and
//! applies it through the command executor:
//!
//! - graceful + service supports signal-based reload => `ReloadMethod::Signal`
//! - otherwise => stop+start (`ReloadMethod::Restart`)
//!
//! One external call per service; failures are reported, never retried here
//! (retry policy belongs to the caller).

use crate::exec::CommandExecutor;
use std::sync::Arc;
use strum_macros::Display;
use tracing::{debug, info, warn};

/// How a service was (or would be) reloaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ReloadMethod {
    /// Signal-based reload, no connection loss
    Signal,
    /// Full stop+start
    Restart,
}

/// Outcome of one reload attempt
#[derive(Debug, Clone)]
pub enum ReloadResult {
    Success {
        service: String,
        method: ReloadMethod,
    },
    Failure {
        service: String,
        error: String,
    },
}

impl ReloadResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ReloadResult::Success { .. })
    }

    pub fn service(&self) -> &str {
        match self {
            ReloadResult::Success { service, .. } => service,
            ReloadResult::Failure { service, .. } => service,
        }
    }
}

/// Applies reloads to system services
pub trait ServiceReloader: Send + Sync {
    fn reload_service(&self, name: &str, graceful: bool) -> ReloadResult;
}

/// systemd-backed reloader
pub struct SystemdReloader {
    exec: Arc<dyn CommandExecutor>,
}

impl SystemdReloader {
    pub fn new(exec: Arc<dyn CommandExecutor>) -> Self {
        Self { exec }
    }

    /// Does the unit advertise signal-based reload support?
    fn supports_reload(&self, name: &str) -> bool {
        // In dry-run mode nothing can be queried; assume the graceful path
        // so the logged intent matches what a real run would try first.
        if self.exec.is_dry_run() {
            return true;
        }
        match self
            .exec
            .run("systemctl", &["show", name, "--property=CanReload", "--value"])
        {
            Ok(output) if output.success() => output.stdout.trim() == "yes",
            _ => false,
        }
    }
}

impl ServiceReloader for SystemdReloader {
    fn reload_service(&self, name: &str, graceful: bool) -> ReloadResult {
        let method = if graceful && self.supports_reload(name) {
            ReloadMethod::Signal
        } else {
            ReloadMethod::Restart
        };

        let verb = match method {
            ReloadMethod::Signal => "reload",
            ReloadMethod::Restart => "restart",
        };

        debug!("Reloading service '{}' via {}", name, method);
        match self.exec.run_checked("systemctl", &[verb, name]) {
            Ok(_) => {
                info!("Service '{}' reloaded ({})", name, method);
                ReloadResult::Success {
                    service: name.to_string(),
                    method,
                }
            }
            Err(e) => {
                warn!("Service '{}' reload failed: {}", name, e);
                ReloadResult::Failure {
                    service: name.to_string(),
                    error: e.to_string(),
                }
            }
        }
    }
}
