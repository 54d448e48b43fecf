//! Log-backed alert sinks for the capacity monitor.
//!
//! Notification delivery and maintenance handling live outside the daemon;
//! these sinks record what would be sent so operators see it in the logs.

use std::collections::BTreeSet;
use std::sync::Mutex;

use async_trait::async_trait;
use shelf_monitor::{MaintenanceSignal, NotificationLevel, Notifier};
use tracing::{error, info, warn};

/// Writes every notification to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str, title: &str, level: NotificationLevel, recipient_role: &str) {
        match level {
            NotificationLevel::Info => info!(role = %recipient_role, %title, "{message}"),
            NotificationLevel::Warning => warn!(role = %recipient_role, %title, "{message}"),
            NotificationLevel::Error => error!(role = %recipient_role, %title, "{message}"),
        }
    }
}

/// Remembers which scopes entered maintenance.
#[derive(Debug, Default)]
pub struct LogMaintenance {
    scopes: Mutex<BTreeSet<String>>,
}

impl LogMaintenance {
    /// Scopes currently in maintenance.
    pub fn scopes(&self) -> Vec<String> {
        self.scopes
            .lock()
            .expect("maintenance lock poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MaintenanceSignal for LogMaintenance {
    async fn set_maintenance(&self, scope: &str) {
        let entered = self
            .scopes
            .lock()
            .expect("maintenance lock poisoned")
            .insert(scope.to_string());
        if entered {
            error!(%scope, "scope entering maintenance mode");
        }
    }
}
