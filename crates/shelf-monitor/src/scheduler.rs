//! Monitor scheduler: runs the capacity monitor for every active scope on a
//! fixed interval.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::error::MonitorError;
use crate::monitor::{CapacityMonitor, CapacityReport};
use crate::traits::ScopeSource;

/// Periodically runs a [`CapacityMonitor`] over the active scopes.
///
/// Each scope runs in its own task. A pass skips a scope whose previous run
/// is still executing.
pub struct MonitorScheduler {
    monitor: Arc<CapacityMonitor>,
    scopes: Arc<dyn ScopeSource>,
    period: Duration,
}

impl MonitorScheduler {
    /// Create a scheduler running every `period`.
    pub fn new(monitor: Arc<CapacityMonitor>, scopes: Arc<dyn ScopeSource>, period: Duration) -> Self {
        Self {
            monitor,
            scopes,
            period,
        }
    }

    /// Run the scheduler loop. Should be spawned as a background task.
    pub async fn run(&self) {
        info!(period_secs = self.period.as_secs(), "monitor scheduler started");
        let mut tick = interval(self.period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tick.tick().await;
            self.tick().await;
        }
    }

    /// One pass: start a run for every active scope not already running.
    ///
    /// Returns the handles of the runs started.
    pub async fn tick(&self) -> Vec<JoinHandle<Result<CapacityReport, MonitorError>>> {
        let scopes = match self.scopes.active_scopes().await {
            Ok(scopes) => scopes,
            Err(e) => {
                error!(error = %e, "failed to list active scopes");
                return Vec::new();
            }
        };

        let mut runs = Vec::with_capacity(scopes.len());
        for scope in scopes {
            if self.monitor.is_running(&scope) {
                debug!(%scope, "previous monitor run still executing, skipped");
                continue;
            }

            let monitor = self.monitor.clone();
            runs.push(tokio::spawn(async move {
                let result = monitor.run(&scope).await;
                match &result {
                    Ok(_) => {}
                    Err(MonitorError::AlreadyRunning(_)) => {
                        debug!(%scope, "previous monitor run still executing, skipped");
                    }
                    Err(e) => warn!(%scope, error = %e, "monitor run failed"),
                }
                result
            }));
        }
        runs
    }
}

impl std::fmt::Debug for MonitorScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorScheduler")
            .field("period", &self.period)
            .finish()
    }
}
