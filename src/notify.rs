// src/notify.rs

//! Update lifecycle notification.
//!
//! The `UpdateNotifier` trait is the side channel through which the
//! orchestrator streams lifecycle events (starting, change applied, reboot
//! required, completed) to an external observer. Implementations:
//!
//! - `LogNotifier`: events go to tracing
//! - `SilentNotifier`: no-op for scripted/quiet use
//! - `CallbackNotifier`: forwards events to a user-provided closure, for
//!   desktop notifications or GUI embedding

use crate::detect::ConfigChange;
use crate::error::Error;
use tracing::{error, info, warn};

/// Receives update lifecycle events
///
/// Implementations must be thread-safe; the orchestrator may be shared
/// across threads even though a single reconciliation is sequential.
pub trait UpdateNotifier: Send + Sync {
    /// A live update is about to apply the given changes
    fn update_starting(&self, changes: &[ConfigChange]);

    /// One change was applied successfully
    fn change_applied(&self, change: &ConfigChange);

    /// One change failed; the update stops after this event
    fn change_failed(&self, change: &ConfigChange, error: &Error);

    /// Changes were detected that can only take effect after a reboot
    fn reboot_required(&self, changes: &[ConfigChange]);

    /// The update finished; `pending` lists deferred reboot-required changes
    fn update_completed(&self, applied: &[ConfigChange], pending: &[ConfigChange]);
}

/// Logs lifecycle events via tracing
#[derive(Debug, Default)]
pub struct LogNotifier;

impl LogNotifier {
    pub fn new() -> Self {
        Self
    }
}

impl UpdateNotifier for LogNotifier {
    fn update_starting(&self, changes: &[ConfigChange]) {
        info!("Starting live update with {} change(s)", changes.len());
        for change in changes {
            info!("  [{}] {}", change.strategy, change.description);
        }
    }

    fn change_applied(&self, change: &ConfigChange) {
        info!("Applied: {}", change.description);
    }

    fn change_failed(&self, change: &ConfigChange, error: &Error) {
        error!("Failed: {} ({})", change.description, error);
    }

    fn reboot_required(&self, changes: &[ConfigChange]) {
        warn!(
            "{} change(s) require a reboot to take effect",
            changes.len()
        );
        for change in changes {
            warn!("  {}", change.description);
        }
    }

    fn update_completed(&self, applied: &[ConfigChange], pending: &[ConfigChange]) {
        if pending.is_empty() {
            info!("Update completed: {} change(s) applied", applied.len());
        } else {
            info!(
                "Update completed: {} applied, {} pending reboot",
                applied.len(),
                pending.len()
            );
        }
    }
}

/// No-op notifier
#[derive(Debug, Default)]
pub struct SilentNotifier;

impl SilentNotifier {
    pub fn new() -> Self {
        Self
    }
}

impl UpdateNotifier for SilentNotifier {
    fn update_starting(&self, _changes: &[ConfigChange]) {}
    fn change_applied(&self, _change: &ConfigChange) {}
    fn change_failed(&self, _change: &ConfigChange, _error: &Error) {}
    fn reboot_required(&self, _changes: &[ConfigChange]) {}
    fn update_completed(&self, _applied: &[ConfigChange], _pending: &[ConfigChange]) {}
}

/// Events emitted by `CallbackNotifier`
#[derive(Debug, Clone)]
pub enum NotifyEvent {
    Starting { change_count: usize },
    Applied { description: String },
    Failed { description: String, error: String },
    RebootRequired { change_count: usize },
    Completed { applied: usize, pending: usize },
}

/// Forwards lifecycle events to a user-provided closure
pub struct CallbackNotifier<F>
where
    F: Fn(NotifyEvent) + Send + Sync,
{
    callback: F,
}

impl<F> CallbackNotifier<F>
where
    F: Fn(NotifyEvent) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> UpdateNotifier for CallbackNotifier<F>
where
    F: Fn(NotifyEvent) + Send + Sync,
{
    fn update_starting(&self, changes: &[ConfigChange]) {
        (self.callback)(NotifyEvent::Starting {
            change_count: changes.len(),
        });
    }

    fn change_applied(&self, change: &ConfigChange) {
        (self.callback)(NotifyEvent::Applied {
            description: change.description.clone(),
        });
    }

    fn change_failed(&self, change: &ConfigChange, error: &Error) {
        (self.callback)(NotifyEvent::Failed {
            description: change.description.clone(),
            error: error.to_string(),
        });
    }

    fn reboot_required(&self, changes: &[ConfigChange]) {
        (self.callback)(NotifyEvent::RebootRequired {
            change_count: changes.len(),
        });
    }

    fn update_completed(&self, applied: &[ConfigChange], pending: &[ConfigChange]) {
        (self.callback)(NotifyEvent::Completed {
            applied: applied.len(),
            pending: pending.len(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SystemConfig;
    use crate::detect::detect_changes;
    use std::sync::{Arc, Mutex};

    fn one_change() -> Vec<ConfigChange> {
        let current = SystemConfig::new();
        let mut target = SystemConfig::new();
        target.hostname = "host".to_string();
        detect_changes(&current, &target)
    }

    #[test]
    fn test_callback_notifier_emits_events_in_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let captured = events.clone();
        let notifier = CallbackNotifier::new(move |event| {
            captured.lock().unwrap().push(event);
        });

        let changes = one_change();
        notifier.update_starting(&changes);
        notifier.change_applied(&changes[0]);
        notifier.update_completed(&changes, &[]);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], NotifyEvent::Starting { change_count: 1 }));
        assert!(matches!(&events[1], NotifyEvent::Applied { description } if description.contains("hostname")));
        assert!(matches!(events[2], NotifyEvent::Completed { applied: 1, pending: 0 }));
    }

    #[test]
    fn test_silent_notifier_accepts_all_events() {
        let notifier = SilentNotifier::new();
        let changes = one_change();
        notifier.update_starting(&changes);
        notifier.reboot_required(&changes);
        notifier.update_completed(&[], &changes);
    }
}
