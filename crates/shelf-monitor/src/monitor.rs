//! One capacity monitor run.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use shelf_registry::{BackendRegistry, RegistryError};
use shelf_types::events::{CapacityLevel, CapacityThresholdCrossed, EventBus};
use shelf_types::{BackendKind, MonitoringRun, unix_now};
use tracing::{debug, error, info, trace, warn};

use crate::error::MonitorError;
use crate::traits::{ADMIN_ROLE, MaintenanceSignal, NotificationLevel, Notifier};

/// Occupation percentages that raise alerts.
///
/// A backend at or above `critical_percent` puts the scope in maintenance;
/// at or above `warning_percent` it only triggers a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Warning threshold, in percent of the allowed capacity.
    pub warning_percent: u32,
    /// Critical threshold, in percent of the allowed capacity.
    pub critical_percent: u32,
}

impl Thresholds {
    /// Validate a pair of thresholds.
    pub fn new(warning_percent: u32, critical_percent: u32) -> Result<Self, MonitorError> {
        if warning_percent == 0 || warning_percent > critical_percent {
            return Err(MonitorError::InvalidThresholds {
                warning: warning_percent,
                critical: critical_percent,
            });
        }
        Ok(Self {
            warning_percent,
            critical_percent,
        })
    }

    /// Alert level for `occupation_percent`, if any.
    pub fn level_for(&self, occupation_percent: f64) -> Option<CapacityLevel> {
        if occupation_percent >= f64::from(self.critical_percent) {
            Some(CapacityLevel::Critical)
        } else if occupation_percent >= f64::from(self.warning_percent) {
            Some(CapacityLevel::Warning)
        } else {
            None
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            warning_percent: 70,
            critical_percent: 90,
        }
    }
}

/// What one run found for one backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendCapacity {
    /// Backend label.
    pub label: String,
    /// Access tier.
    pub kind: BackendKind,
    /// Referenced bytes.
    pub used_bytes: u64,
    /// Referenced files.
    pub file_count: u64,
    /// Capacity granted to the backend, if bounded.
    pub allowed_bytes: Option<u64>,
    /// `None` when the backend has no allowed capacity.
    pub occupation_percent: Option<f64>,
    /// Threshold crossed, if any.
    pub level: Option<CapacityLevel>,
}

/// Summary of one monitor run.
#[derive(Debug, Clone, PartialEq)]
pub struct CapacityReport {
    /// Scope the run was made for.
    pub scope: String,
    /// Unix timestamp (seconds) at the start of the run.
    pub ran_at: u64,
    /// Wall time of the run.
    pub duration_ms: u64,
    /// Every registered backend, in kind then priority order.
    pub backends: Vec<BackendCapacity>,
    /// Whether the run put the scope in maintenance.
    pub maintenance: bool,
}

impl CapacityReport {
    /// Backends that crossed a threshold.
    pub fn alerts(&self) -> impl Iterator<Item = &BackendCapacity> {
        self.backends.iter().filter(|b| b.level.is_some())
    }

    /// The entry for `label`.
    pub fn backend(&self, label: &str) -> Option<&BackendCapacity> {
        self.backends.iter().find(|b| b.label == label)
    }
}

/// Aggregates backend usage and raises capacity alerts.
pub struct CapacityMonitor {
    registry: Arc<BackendRegistry>,
    notifier: Arc<dyn Notifier>,
    maintenance: Arc<dyn MaintenanceSignal>,
    events: EventBus,
    thresholds: Thresholds,
    running: Mutex<HashSet<String>>,
}

impl CapacityMonitor {
    /// Create a monitor over `registry`.
    pub fn new(
        registry: Arc<BackendRegistry>,
        notifier: Arc<dyn Notifier>,
        maintenance: Arc<dyn MaintenanceSignal>,
        events: EventBus,
        thresholds: Thresholds,
    ) -> Self {
        Self {
            registry,
            notifier,
            maintenance,
            events,
            thresholds,
            running: Mutex::new(HashSet::new()),
        }
    }

    /// Thresholds in use.
    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// Whether a run for `scope` is in progress.
    pub fn is_running(&self, scope: &str) -> bool {
        self.running
            .lock()
            .expect("monitor lock poisoned")
            .contains(scope)
    }

    /// Run the monitor once for `scope`.
    ///
    /// Fails with [`MonitorError::AlreadyRunning`] when another run for the
    /// same scope has not finished.
    #[tracing::instrument(name = "capacity_monitor", skip(self))]
    pub async fn run(&self, scope: &str) -> Result<CapacityReport, MonitorError> {
        let _guard = RunGuard::acquire(&self.running, scope)?;
        let meta = self.registry.meta();

        let mut bookkeeping = meta.get_monitoring_run(scope)?.unwrap_or_default();
        bookkeeping.running = true;
        meta.put_monitoring_run(scope, &bookkeeping)?;

        let started = Instant::now();
        let ran_at = unix_now();
        let result = self.measure(scope, ran_at).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        // Clear the flag even when the run failed.
        let finished = match &result {
            Ok(_) => MonitoringRun {
                running: false,
                last_run_at: Some(ran_at),
                last_duration_ms: Some(duration_ms),
            },
            Err(_) => MonitoringRun {
                running: false,
                ..bookkeeping
            },
        };
        if let Err(e) = meta.put_monitoring_run(scope, &finished) {
            error!(%scope, error = %e, "failed to persist monitoring bookkeeping");
            if result.is_ok() {
                return Err(e.into());
            }
        }

        let (backends, maintenance) = result?;
        info!(
            %scope,
            backends = backends.len(),
            alerts = backends.iter().filter(|b| b.level.is_some()).count(),
            maintenance,
            duration_ms,
            "capacity monitor run done"
        );
        Ok(CapacityReport {
            scope: scope.to_string(),
            ran_at,
            duration_ms,
            backends,
            maintenance,
        })
    }

    async fn measure(
        &self,
        scope: &str,
        at: u64,
    ) -> Result<(Vec<BackendCapacity>, bool), MonitorError> {
        let usage = self.registry.meta().usage_per_backend()?;
        let mut backends = Vec::new();
        let mut maintenance = false;

        for config in self.registry.list_all() {
            let totals = usage.get(&config.label).copied().unwrap_or_default();
            let config = match self.registry.record_usage(
                &config.label,
                totals.used_bytes,
                totals.file_count,
                at,
            ) {
                Ok(config) => config,
                Err(RegistryError::NotFound(_)) => {
                    debug!(label = %config.label, "backend deleted during the run, skipped");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let occupation_percent = config.occupation_percent();
            let level = match occupation_percent {
                Some(ratio) => self.thresholds.level_for(ratio),
                None => {
                    debug!(label = %config.label, "no allowed capacity configured, ratio skipped");
                    None
                }
            };

            if let (Some(level), Some(ratio)) = (level, occupation_percent) {
                self.alert(scope, &config.label, ratio, level).await;
                if level == CapacityLevel::Critical {
                    maintenance = true;
                }
            } else if let Some(ratio) = occupation_percent {
                trace!(label = %config.label, ratio, "backend below thresholds");
            }

            backends.push(BackendCapacity {
                label: config.label,
                kind: config.kind,
                used_bytes: config.used_capacity_bytes,
                file_count: config.file_count,
                allowed_bytes: config.allowed_capacity_bytes,
                occupation_percent,
                level,
            });
        }

        for label in usage.keys() {
            if self.registry.get_by_label(label).is_none() {
                warn!(%label, "files reference an unregistered backend");
            }
        }

        Ok((backends, maintenance))
    }

    async fn alert(&self, scope: &str, label: &str, ratio: f64, level: CapacityLevel) {
        match level {
            CapacityLevel::Critical => {
                let message = format!(
                    "Storage location {label} has reached its critical disk usage threshold.\n\
                     Actual occupation: {ratio:.2}%, critical threshold: {}%",
                    self.thresholds.critical_percent
                );
                error!(%scope, %label, ratio, "{message}");
                self.notifier
                    .notify(
                        &message,
                        &format!("Data storage {label} is full"),
                        NotificationLevel::Error,
                        ADMIN_ROLE,
                    )
                    .await;
                self.maintenance.set_maintenance(scope).await;
            }
            CapacityLevel::Warning => {
                let message = format!(
                    "Storage location {label} has reached its disk usage threshold.\n\
                     Actual occupation: {ratio:.2}%, threshold: {}%",
                    self.thresholds.warning_percent
                );
                warn!(%scope, %label, ratio, "{message}");
                self.notifier
                    .notify(
                        &message,
                        &format!("Data storage {label} is almost full"),
                        NotificationLevel::Warning,
                        ADMIN_ROLE,
                    )
                    .await;
            }
        }

        self.events.emit(CapacityThresholdCrossed {
            scope: scope.to_string(),
            backend_label: label.to_string(),
            occupation_percent: ratio,
            level,
        });
    }
}

impl std::fmt::Debug for CapacityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapacityMonitor")
            .field("thresholds", &self.thresholds)
            .finish()
    }
}

/// Marks a scope as running until dropped.
struct RunGuard<'a> {
    running: &'a Mutex<HashSet<String>>,
    scope: String,
}

impl<'a> RunGuard<'a> {
    fn acquire(running: &'a Mutex<HashSet<String>>, scope: &str) -> Result<Self, MonitorError> {
        let mut set = running.lock().expect("monitor lock poisoned");
        if !set.insert(scope.to_string()) {
            return Err(MonitorError::AlreadyRunning(scope.to_string()));
        }
        Ok(Self {
            running,
            scope: scope.to_string(),
        })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running
            .lock()
            .expect("monitor lock poisoned")
            .remove(&self.scope);
    }
}
