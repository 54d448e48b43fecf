//! Availability resolution across tiers.
//!
//! For each file the first matching rule decides:
//!
//! 1. a live cache entry: available until the entry expires;
//! 2. an online backend: available, no expiry;
//! 3. a nearline backend: unavailable straight away when a previous check
//!    already said so, otherwise the plugin is asked. A negative answer is
//!    latched on the file reference so the plugin is not asked again;
//! 4. anything else: unavailable.
//!
//! Files without a reference are left out of the answer.

use std::collections::BTreeSet;
use std::sync::Arc;

use shelf_registry::BackendRegistry;
use shelf_types::events::{EventBus, NearlineConfirmed};
use shelf_types::{AvailabilityStatus, BackendConfig, BackendKind, Checksum, FileReference, unix_now};
use tracing::{debug, info, warn};

use crate::error::EngineError;

/// Default upper bound on checksums per request.
pub const DEFAULT_MAX_BULK_SIZE: usize = 100;

/// Answers whether files can be read right now.
pub struct AvailabilityResolver {
    registry: Arc<BackendRegistry>,
    events: EventBus,
    max_bulk_size: usize,
}

impl AvailabilityResolver {
    /// Create a resolver accepting at most `max_bulk_size` checksums per call.
    pub fn new(registry: Arc<BackendRegistry>, events: EventBus, max_bulk_size: usize) -> Self {
        Self {
            registry,
            events,
            max_bulk_size,
        }
    }

    /// Resolve the availability of `checksums`.
    ///
    /// Duplicates are resolved once; the answer is sorted by checksum. A
    /// failing nearline check aborts the call and leaves the file's flag
    /// untouched.
    pub async fn check(
        &self,
        checksums: &[Checksum],
    ) -> Result<Vec<AvailabilityStatus>, EngineError> {
        if checksums.len() > self.max_bulk_size {
            return Err(EngineError::InvalidRequest(format!(
                "{} checksums requested, at most {} allowed",
                checksums.len(),
                self.max_bulk_size
            )));
        }

        let wanted: BTreeSet<&Checksum> = checksums.iter().collect();
        let meta = self.registry.meta();
        let now = unix_now();
        let mut statuses = Vec::with_capacity(wanted.len());

        for checksum in wanted {
            let Some(reference) = meta.get_file(checksum)? else {
                debug!(%checksum, "no reference, skipped");
                continue;
            };

            if let Some(entry) = meta.get_cache_entry(checksum)? {
                if entry.is_live(now) {
                    statuses.push(AvailabilityStatus::available(
                        checksum.clone(),
                        Some(entry.expiration_date),
                    ));
                    continue;
                }
                debug!(%checksum, expired_at = entry.expiration_date, "dropping expired cache entry");
                if !meta.remove_expired_cache_entry(checksum, entry.expiration_date)? {
                    // Restored again since it was read.
                    if let Some(fresh) = meta.get_cache_entry(checksum)? {
                        if fresh.is_live(now) {
                            statuses.push(AvailabilityStatus::available(
                                checksum.clone(),
                                Some(fresh.expiration_date),
                            ));
                            continue;
                        }
                    }
                }
            }

            let Some(backend) = self.registry.get_by_label(&reference.backend_label) else {
                warn!(%checksum, backend = %reference.backend_label, "file references unknown backend");
                statuses.push(AvailabilityStatus::unavailable(checksum.clone()));
                continue;
            };

            let status = match backend.kind {
                BackendKind::Online => AvailabilityStatus::available(checksum.clone(), None),
                BackendKind::Nearline => self.resolve_nearline(&reference, &backend).await?,
                BackendKind::Offline => AvailabilityStatus::unavailable(checksum.clone()),
            };
            statuses.push(status);
        }

        Ok(statuses)
    }

    async fn resolve_nearline(
        &self,
        reference: &FileReference,
        backend: &BackendConfig,
    ) -> Result<AvailabilityStatus, EngineError> {
        let checksum = &reference.checksum;
        if reference.nearline_confirmed {
            debug!(%checksum, backend = %backend.label, "nearline unavailability already confirmed");
            return Ok(AvailabilityStatus::unavailable(checksum.clone()));
        }

        let Some(plugin) = self.registry.plugin_for(&backend.label) else {
            warn!(%checksum, backend = %backend.label, "no plugin attached, cannot check nearline file");
            return Ok(AvailabilityStatus::unavailable(checksum.clone()));
        };

        let answer = plugin
            .check_availability(reference)
            .await
            .map_err(|source| EngineError::RemoteCheck {
                checksum: checksum.clone(),
                backend: backend.label.clone(),
                source,
            })?;

        if answer.available {
            return Ok(AvailabilityStatus::available(
                checksum.clone(),
                answer.expires_at,
            ));
        }

        self.registry.meta().set_nearline_confirmed(checksum, true)?;
        info!(%checksum, backend = %backend.label, message = ?answer.message, "nearline file confirmed unavailable");
        self.events.emit(NearlineConfirmed {
            checksum: checksum.clone(),
            backend_label: backend.label.clone(),
        });
        Ok(AvailabilityStatus::unavailable(checksum.clone()))
    }
}
