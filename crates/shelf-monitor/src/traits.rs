//! Collaborators the monitor reports to.

use std::fmt;

use async_trait::async_trait;

use crate::error::MonitorError;

/// Role that receives capacity notifications.
pub const ADMIN_ROLE: &str = "ADMIN";

/// Severity of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    /// Informational.
    Info,
    /// Something needs attention soon.
    Warning,
    /// Something is broken or full.
    Error,
}

impl fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        })
    }
}

/// Lists the scopes a scheduled pass should monitor.
#[async_trait]
pub trait ScopeSource: Send + Sync {
    /// Scopes active right now. Called once per pass.
    async fn active_scopes(&self) -> Result<Vec<String>, MonitorError>;
}

/// Delivers notifications to people.
///
/// Fire-and-forget: delivery failures are the implementation's business.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send `message` with `title` to every holder of `recipient_role`.
    async fn notify(&self, message: &str, title: &str, level: NotificationLevel, recipient_role: &str);
}

/// Puts a scope in maintenance mode.
#[async_trait]
pub trait MaintenanceSignal: Send + Sync {
    /// Enter maintenance for `scope`. Idempotent.
    async fn set_maintenance(&self, scope: &str);
}

/// A fixed list of scopes.
#[derive(Debug, Clone, Default)]
pub struct StaticScopes(Vec<String>);

impl StaticScopes {
    /// Monitor exactly `scopes`.
    pub fn new<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(scopes.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl ScopeSource for StaticScopes {
    async fn active_scopes(&self) -> Result<Vec<String>, MonitorError> {
        Ok(self.0.clone())
    }
}
