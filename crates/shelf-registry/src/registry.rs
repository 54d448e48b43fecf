//! [`BackendRegistry`]: per-kind ordered backend lists.
//!
//! Every kind owns a write gate and a published [`TierSnapshot`]. A writer
//! takes the gate, computes the next ordering from the current snapshot,
//! persists the rows that changed and only then swaps the snapshot in.
//! Readers clone the published `Arc` and never wait on storage.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use shelf_meta::MetaStore;
use shelf_store::StoragePlugin;
use shelf_types::{BackendConfig, BackendId, BackendKind, BackendSpec};
use tracing::{debug, info, warn};

use crate::error::RegistryError;

type Result<T> = std::result::Result<T, RegistryError>;

/// Immutable view of one kind's backends, ascending by priority.
#[derive(Debug, Clone, Default)]
pub struct TierSnapshot {
    /// Bumped every time a new snapshot is published for the kind.
    pub version: u64,
    /// Backends of the kind; `backends[i].priority == i`.
    pub backends: Vec<BackendConfig>,
}

impl TierSnapshot {
    fn position(&self, id: &BackendId) -> Option<usize> {
        self.backends.iter().position(|b| b.id == *id)
    }
}

struct Tier {
    gate: Mutex<()>,
    current: RwLock<Arc<TierSnapshot>>,
}

impl Tier {
    fn new(backends: Vec<BackendConfig>) -> Self {
        Self {
            gate: Mutex::new(()),
            current: RwLock::new(Arc::new(TierSnapshot {
                version: 0,
                backends,
            })),
        }
    }

    fn load(&self) -> Arc<TierSnapshot> {
        self.current
            .read()
            .expect("registry lock poisoned")
            .clone()
    }

    /// Replace the snapshot. Caller must hold the gate.
    fn publish(&self, backends: Vec<BackendConfig>) -> u64 {
        let mut current = self.current.write().expect("registry lock poisoned");
        let version = current.version + 1;
        *current = Arc::new(TierSnapshot { version, backends });
        version
    }
}

/// Registry of configured storage backends.
///
/// Mutations on one kind are serialized; different kinds never contend.
/// Registration additionally serializes across kinds so labels stay unique.
pub struct BackendRegistry {
    meta: Arc<MetaStore>,
    tiers: [Tier; 3],
    plugins: RwLock<HashMap<String, Arc<dyn StoragePlugin>>>,
    labels_gate: Mutex<()>,
}

impl BackendRegistry {
    /// Load the registry from `meta`.
    ///
    /// Priorities of each kind are renumbered to `0..n`, keeping their
    /// relative order, and the renumbered rows are written back. Plugins are
    /// not persisted: bind them again with [`attach_plugin`](Self::attach_plugin).
    pub fn open(meta: Arc<MetaStore>) -> Result<Self> {
        let mut by_kind: [Vec<BackendConfig>; 3] = Default::default();
        for config in meta.list_backends()? {
            by_kind[config.kind.index()].push(config);
        }

        for backends in &mut by_kind {
            backends.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.label.cmp(&b.label)));
            for (position, config) in backends.iter_mut().enumerate() {
                let priority = position as u32;
                if config.priority != priority {
                    warn!(
                        label = %config.label,
                        stored = config.priority,
                        priority,
                        "renumbering backend priority"
                    );
                    config.priority = priority;
                    meta.put_backend(config)?;
                }
            }
        }

        let [online, nearline, offline] = by_kind;
        info!(
            online = online.len(),
            nearline = nearline.len(),
            offline = offline.len(),
            "backend registry loaded"
        );

        Ok(Self {
            meta,
            tiers: [Tier::new(online), Tier::new(nearline), Tier::new(offline)],
            plugins: RwLock::new(HashMap::new()),
            labels_gate: Mutex::new(()),
        })
    }

    fn tier(&self, kind: BackendKind) -> &Tier {
        &self.tiers[kind.index()]
    }

    /// The metadata store the registry persists into.
    pub fn meta(&self) -> &Arc<MetaStore> {
        &self.meta
    }

    // ----- Registration -----

    /// Register a new backend with the plugin implementing it.
    ///
    /// The backend is appended after every existing backend of its kind.
    pub fn register(
        &self,
        spec: BackendSpec,
        plugin: Arc<dyn StoragePlugin>,
    ) -> Result<BackendConfig> {
        if spec.label.trim().is_empty() {
            return Err(RegistryError::InvalidConfiguration(
                "backend label must not be empty".into(),
            ));
        }
        if plugin.kind() != spec.kind {
            return Err(RegistryError::CapabilityMismatch {
                label: spec.label,
                declared: spec.kind,
                actual: plugin.kind(),
            });
        }

        let _labels = self.labels_gate.lock().expect("registry lock poisoned");
        if self.get_by_label(&spec.label).is_some() {
            return Err(RegistryError::DuplicateLabel(spec.label));
        }

        let tier = self.tier(spec.kind);
        let _gate = tier.gate.lock().expect("registry lock poisoned");
        let current = tier.load();

        let priority = current
            .backends
            .iter()
            .map(|b| b.priority + 1)
            .max()
            .unwrap_or(0);
        let config = BackendConfig::from_spec(spec, priority);
        self.meta.put_backend(&config)?;

        let mut backends = current.backends.clone();
        backends.push(config.clone());
        let version = tier.publish(backends);

        self.plugins
            .write()
            .expect("registry lock poisoned")
            .insert(config.label.clone(), plugin);

        info!(label = %config.label, kind = %config.kind, priority, version, "backend registered");
        Ok(config)
    }

    /// Bind `plugin` to an already registered backend.
    pub fn attach_plugin(&self, label: &str, plugin: Arc<dyn StoragePlugin>) -> Result<()> {
        let config = self
            .get_by_label(label)
            .ok_or_else(|| RegistryError::NotFound(label.to_string()))?;
        if plugin.kind() != config.kind {
            return Err(RegistryError::CapabilityMismatch {
                label: config.label,
                declared: config.kind,
                actual: plugin.kind(),
            });
        }

        self.plugins
            .write()
            .expect("registry lock poisoned")
            .insert(config.label, plugin);
        debug!(%label, "plugin attached");
        Ok(())
    }

    // ----- Lookups -----

    /// Current snapshot of one kind.
    pub fn snapshot(&self, kind: BackendKind) -> Arc<TierSnapshot> {
        self.tier(kind).load()
    }

    /// Backends of `kind`, ascending by priority.
    pub fn list_by_kind(&self, kind: BackendKind) -> Vec<BackendConfig> {
        self.snapshot(kind).backends.clone()
    }

    /// Every backend, grouped by kind, each group ascending by priority.
    pub fn list_all(&self) -> Vec<BackendConfig> {
        BackendKind::ALL
            .iter()
            .flat_map(|kind| self.list_by_kind(*kind))
            .collect()
    }

    /// Backend with the given id.
    pub fn get(&self, id: &BackendId) -> Option<BackendConfig> {
        BackendKind::ALL.iter().find_map(|kind| {
            let snapshot = self.snapshot(*kind);
            snapshot.position(id).map(|i| snapshot.backends[i].clone())
        })
    }

    /// Backend with the given label.
    pub fn get_by_label(&self, label: &str) -> Option<BackendConfig> {
        self.get(&BackendId::from_label(label))
    }

    /// Backends whose label is in `labels`, in [`list_all`](Self::list_all) order.
    pub fn search_by_labels<S: AsRef<str>>(&self, labels: &[S]) -> Vec<BackendConfig> {
        self.list_all()
            .into_iter()
            .filter(|b| labels.iter().any(|l| l.as_ref() == b.label))
            .collect()
    }

    /// Active backend of `kind` with the lowest priority.
    pub fn first_active(&self, kind: BackendKind) -> Option<BackendConfig> {
        self.snapshot(kind)
            .backends
            .iter()
            .find(|b| b.active)
            .cloned()
    }

    /// Active backend of `kind` among `candidates` with the lowest priority.
    pub fn highest_active_for<S: AsRef<str>>(
        &self,
        candidates: &[S],
        kind: BackendKind,
    ) -> Option<BackendConfig> {
        self.snapshot(kind)
            .backends
            .iter()
            .find(|b| b.active && candidates.iter().any(|c| c.as_ref() == b.label))
            .cloned()
    }

    /// Plugin bound to the backend `label`.
    pub fn plugin_for(&self, label: &str) -> Option<Arc<dyn StoragePlugin>> {
        self.plugins
            .read()
            .expect("registry lock poisoned")
            .get(label)
            .cloned()
    }

    /// Whether deletion jobs on `label` remove data physically.
    ///
    /// `false` when no plugin is attached.
    pub fn allow_physical_deletion(&self, label: &str) -> bool {
        self.plugin_for(label)
            .is_some_and(|plugin| plugin.allow_physical_deletion())
    }

    // ----- Ordering -----

    /// Move a backend one step earlier within its kind.
    ///
    /// Does nothing when it is already first.
    pub fn increase_priority(&self, id: &BackendId) -> Result<()> {
        self.swap_with_neighbour(id, Direction::Up)
    }

    /// Move a backend one step later within its kind.
    ///
    /// Does nothing when it is already last.
    pub fn decrease_priority(&self, id: &BackendId) -> Result<()> {
        self.swap_with_neighbour(id, Direction::Down)
    }

    fn swap_with_neighbour(&self, id: &BackendId, direction: Direction) -> Result<()> {
        let kind = self
            .get(id)
            .map(|b| b.kind)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        let tier = self.tier(kind);
        let _gate = tier.gate.lock().expect("registry lock poisoned");
        let current = tier.load();

        // Re-resolve under the gate: the backend may have been deleted.
        let position = current
            .position(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let neighbour = match direction {
            Direction::Up if position == 0 => None,
            Direction::Up => Some(position - 1),
            Direction::Down if position + 1 == current.backends.len() => None,
            Direction::Down => Some(position + 1),
        };
        let Some(neighbour) = neighbour else {
            debug!(label = %current.backends[position].label, ?direction, "no neighbour, priority unchanged");
            return Ok(());
        };

        let mut backends = current.backends.clone();
        backends.swap(position, neighbour);
        backends[position].priority = position as u32;
        backends[neighbour].priority = neighbour as u32;

        self.meta
            .commit_backends([&backends[position], &backends[neighbour]], None)?;

        let moved = backends[neighbour].label.clone();
        let displaced = backends[position].label.clone();
        let version = tier.publish(backends);

        info!(
            label = %moved,
            priority = neighbour,
            displaced = %displaced,
            version,
            "backend priority swapped"
        );
        Ok(())
    }

    // ----- Update and delete -----

    /// Replace the mutable part of a backend's configuration.
    ///
    /// Label and kind cannot change; priority and usage are kept. When
    /// files are already stored on the backend, its plugin decides whether
    /// the change is safe.
    pub fn update(&self, id: &BackendId, spec: BackendSpec) -> Result<BackendConfig> {
        let existing = self
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if spec.label != existing.label {
            return Err(RegistryError::InvalidConfiguration(format!(
                "label of {:?} cannot change to {:?}",
                existing.label, spec.label
            )));
        }
        if spec.kind != existing.kind {
            return Err(RegistryError::InvalidConfiguration(format!(
                "kind of {:?} cannot change from {} to {}",
                existing.label, existing.kind, spec.kind
            )));
        }

        let tier = self.tier(existing.kind);
        let _gate = tier.gate.lock().expect("registry lock poisoned");
        let current = tier.load();
        let position = current
            .position(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let old = &current.backends[position];

        let mut updated = old.clone();
        updated.active = spec.active;
        updated.allowed_capacity_bytes = spec.allowed_capacity_bytes;
        updated.settings = spec.settings;

        let stored = self.meta.count_files_on(&old.label)?;
        if stored > 0 {
            let plugin = self.plugin_for(&old.label).ok_or_else(|| RegistryError::Forbidden {
                label: old.label.clone(),
                reason: "no plugin attached to validate the change".into(),
            })?;
            let answer = plugin.allow_configuration_update(&updated, old, true);
            if !answer.allowed {
                return Err(RegistryError::Forbidden {
                    label: old.label.clone(),
                    reason: answer
                        .reason
                        .unwrap_or_else(|| "refused by plugin".to_string()),
                });
            }
        }

        self.meta.put_backend(&updated)?;
        let mut backends = current.backends.clone();
        backends[position] = updated.clone();
        let version = tier.publish(backends);

        info!(label = %updated.label, active = updated.active, stored, version, "backend updated");
        Ok(updated)
    }

    /// Remove a backend that no file references.
    ///
    /// Later backends of the same kind move up one step.
    pub fn delete(&self, id: &BackendId) -> Result<BackendConfig> {
        let kind = self
            .get(id)
            .map(|b| b.kind)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        let tier = self.tier(kind);
        let _gate = tier.gate.lock().expect("registry lock poisoned");
        let current = tier.load();
        let position = current
            .position(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let removed = current.backends[position].clone();

        let stored = self.meta.count_files_on(&removed.label)?;
        if stored > 0 {
            return Err(RegistryError::Forbidden {
                label: removed.label,
                reason: format!("{stored} file(s) still reference this backend"),
            });
        }

        let mut backends = current.backends.clone();
        backends.remove(position);
        for config in backends.iter_mut().skip(position) {
            config.priority -= 1;
        }
        self.meta
            .commit_backends(backends.iter().skip(position), Some(id))?;
        let version = tier.publish(backends);

        self.plugins
            .write()
            .expect("registry lock poisoned")
            .remove(&removed.label);

        info!(label = %removed.label, kind = %removed.kind, version, "backend deleted");
        Ok(removed)
    }

    // ----- Usage -----

    /// Store the usage figures computed by a capacity monitor run.
    pub fn record_usage(
        &self,
        label: &str,
        used_bytes: u64,
        file_count: u64,
        at: u64,
    ) -> Result<BackendConfig> {
        let id = BackendId::from_label(label);
        let kind = self
            .get(&id)
            .map(|b| b.kind)
            .ok_or_else(|| RegistryError::NotFound(label.to_string()))?;

        let tier = self.tier(kind);
        let _gate = tier.gate.lock().expect("registry lock poisoned");
        let current = tier.load();
        let position = current
            .position(&id)
            .ok_or_else(|| RegistryError::NotFound(label.to_string()))?;

        let mut backends = current.backends.clone();
        let config = &mut backends[position];
        config.used_capacity_bytes = used_bytes;
        config.file_count = file_count;
        config.last_monitored_at = Some(at);
        self.meta.put_backend(config)?;

        let updated = config.clone();
        tier.publish(backends);

        debug!(%label, used_bytes, file_count, "backend usage recorded");
        Ok(updated)
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("BackendRegistry");
        for kind in BackendKind::ALL {
            s.field(kind.as_str(), &self.snapshot(kind).backends.len());
        }
        s.finish()
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Up,
    Down,
}
