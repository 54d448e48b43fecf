//! [`MetaStore`] implementation wrapping Fjall keyspaces.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use fjall::{Database, Keyspace, KeyspaceCreateOptions};
use shelf_types::{
    BackendConfig, BackendId, BackendUsage, CacheFileEntry, Checksum, FileReference,
    MonitoringRun,
};
use tracing::debug;

use crate::MetaError;

type Result<T> = std::result::Result<T, MetaError>;

/// Bookkeeping store backed by Fjall.
pub struct MetaStore {
    /// The underlying Fjall database handle.
    db: Database,
    /// BackendId → serialized BackendConfig.
    backends: Keyspace,
    /// checksum → serialized FileReference.
    files: Keyspace,
    /// checksum → serialized CacheFileEntry.
    cache: Keyspace,
    /// scope → serialized MonitoringRun.
    monitoring: Keyspace,
    /// Serializes cache writes against conditional removals.
    cache_writes: Mutex<()>,
}

impl MetaStore {
    /// Open a persistent MetaStore at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::builder(path).open()?;
        Self::init_keyspaces(db)
    }

    /// Open a temporary MetaStore that is cleaned up on drop.
    ///
    /// Useful for tests.
    pub fn open_temporary() -> Result<Self> {
        let tmp = tempfile::tempdir().map_err(std::io::Error::other)?;
        let db = Database::builder(tmp.path()).temporary(true).open()?;
        Self::init_keyspaces(db)
    }

    fn init_keyspaces(db: Database) -> Result<Self> {
        let backends = db.keyspace("backends", KeyspaceCreateOptions::default)?;
        let files = db.keyspace("files", KeyspaceCreateOptions::default)?;
        let cache = db.keyspace("cache", KeyspaceCreateOptions::default)?;
        let monitoring = db.keyspace("monitoring", KeyspaceCreateOptions::default)?;
        Ok(Self {
            db,
            backends,
            files,
            cache,
            monitoring,
            cache_writes: Mutex::new(()),
        })
    }

    // ----- Backends -----

    /// Store or overwrite a backend config, keyed by its id.
    pub fn put_backend(&self, config: &BackendConfig) -> Result<()> {
        let value = postcard::to_allocvec(config)?;
        self.backends
            .insert(config.id.as_bytes(), value.as_slice())?;
        debug!(label = %config.label, priority = config.priority, "stored backend config");
        Ok(())
    }

    /// Retrieve a backend config by id.
    pub fn get_backend(&self, id: &BackendId) -> Result<Option<BackendConfig>> {
        match self.backends.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// List every stored backend config, in key order.
    pub fn list_backends(&self) -> Result<Vec<BackendConfig>> {
        let mut configs = Vec::new();
        for guard in self.backends.iter() {
            let v = guard.value()?;
            configs.push(postcard::from_bytes(&v)?);
        }
        Ok(configs)
    }

    /// Remove a backend config.
    pub fn remove_backend(&self, id: &BackendId) -> Result<()> {
        self.backends.remove(id.as_bytes())?;
        debug!(%id, "removed backend config");
        Ok(())
    }

    /// Write `rows` and drop the backend `removed` in one atomic batch.
    pub fn commit_backends<'a>(
        &self,
        rows: impl IntoIterator<Item = &'a BackendConfig>,
        removed: Option<&BackendId>,
    ) -> Result<()> {
        let mut batch = self.db.batch();
        let mut written = 0usize;
        for config in rows {
            let value = postcard::to_allocvec(config)?;
            batch.insert(&self.backends, config.id.as_bytes(), value.as_slice());
            written += 1;
        }
        if let Some(id) = removed {
            batch.remove(&self.backends, id.as_bytes());
        }
        batch.commit()?;
        debug!(written, removed = removed.is_some(), "committed backend rows");
        Ok(())
    }

    // ----- File references -----

    /// Store or overwrite a file reference, keyed by checksum.
    pub fn put_file(&self, reference: &FileReference) -> Result<()> {
        let value = postcard::to_allocvec(reference)?;
        self.files
            .insert(reference.checksum.as_str().as_bytes(), value.as_slice())?;
        debug!(checksum = %reference.checksum, backend = %reference.backend_label, "stored file reference");
        Ok(())
    }

    /// Retrieve a file reference by checksum.
    pub fn get_file(&self, checksum: &Checksum) -> Result<Option<FileReference>> {
        match self.files.get(checksum.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Retrieve the references that exist among `checksums`.
    ///
    /// Unknown checksums are skipped.
    pub fn get_files<'a>(
        &self,
        checksums: impl IntoIterator<Item = &'a Checksum>,
    ) -> Result<Vec<FileReference>> {
        let mut found = Vec::new();
        for checksum in checksums {
            if let Some(reference) = self.get_file(checksum)? {
                found.push(reference);
            }
        }
        Ok(found)
    }

    /// List every file reference.
    pub fn list_files(&self) -> Result<Vec<FileReference>> {
        let mut references = Vec::new();
        for guard in self.files.iter() {
            let v = guard.value()?;
            references.push(postcard::from_bytes(&v)?);
        }
        Ok(references)
    }

    /// Remove a file reference.
    pub fn remove_file(&self, checksum: &Checksum) -> Result<()> {
        self.files.remove(checksum.as_str().as_bytes())?;
        debug!(%checksum, "removed file reference");
        Ok(())
    }

    /// Set the nearline confirmation flag of a reference.
    ///
    /// Returns `false` when no reference exists for `checksum`.
    pub fn set_nearline_confirmed(&self, checksum: &Checksum, confirmed: bool) -> Result<bool> {
        let Some(mut reference) = self.get_file(checksum)? else {
            return Ok(false);
        };
        if reference.nearline_confirmed != confirmed {
            reference.nearline_confirmed = confirmed;
            self.put_file(&reference)?;
        }
        Ok(true)
    }

    /// Number of files referencing the backend `label`.
    ///
    /// Note: this is an O(n) scan.
    pub fn count_files_on(&self, label: &str) -> Result<u64> {
        let mut count = 0;
        for guard in self.files.iter() {
            let v = guard.value()?;
            let reference: FileReference = postcard::from_bytes(&v)?;
            if reference.backend_label == label {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Total referenced bytes and file count per backend label.
    ///
    /// Note: this is an O(n) scan.
    pub fn usage_per_backend(&self) -> Result<BTreeMap<String, BackendUsage>> {
        let mut usage: BTreeMap<String, BackendUsage> = BTreeMap::new();
        for guard in self.files.iter() {
            let v = guard.value()?;
            let reference: FileReference = postcard::from_bytes(&v)?;
            let entry = usage.entry(reference.backend_label).or_default();
            entry.used_bytes += reference.size_bytes;
            entry.file_count += 1;
        }
        Ok(usage)
    }

    // ----- Cache entries -----

    /// Store or overwrite a cache entry, keyed by checksum.
    pub fn put_cache_entry(&self, entry: &CacheFileEntry) -> Result<()> {
        let value = postcard::to_allocvec(entry)?;
        let _guard = self.cache_writes.lock().expect("cache lock poisoned");
        self.cache
            .insert(entry.checksum.as_str().as_bytes(), value.as_slice())?;
        debug!(checksum = %entry.checksum, expires_at = entry.expiration_date, "stored cache entry");
        Ok(())
    }

    /// Retrieve a cache entry by checksum, expired or not.
    pub fn get_cache_entry(&self, checksum: &Checksum) -> Result<Option<CacheFileEntry>> {
        match self.cache.get(checksum.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// List every cache entry, expired or not.
    pub fn list_cache_entries(&self) -> Result<Vec<CacheFileEntry>> {
        let mut entries = Vec::new();
        for guard in self.cache.iter() {
            let v = guard.value()?;
            entries.push(postcard::from_bytes(&v)?);
        }
        Ok(entries)
    }

    /// Remove a cache entry.
    pub fn remove_cache_entry(&self, checksum: &Checksum) -> Result<()> {
        let _guard = self.cache_writes.lock().expect("cache lock poisoned");
        self.cache.remove(checksum.as_str().as_bytes())?;
        debug!(%checksum, "removed cache entry");
        Ok(())
    }

    /// Remove the cache entry of `checksum` only if it still expires at
    /// `expiration_date`.
    ///
    /// Returns `false` when the entry was replaced or already gone.
    pub fn remove_expired_cache_entry(
        &self,
        checksum: &Checksum,
        expiration_date: u64,
    ) -> Result<bool> {
        let _guard = self.cache_writes.lock().expect("cache lock poisoned");
        let Some(bytes) = self.cache.get(checksum.as_str().as_bytes())? else {
            return Ok(false);
        };
        let current: CacheFileEntry = postcard::from_bytes(&bytes)?;
        if current.expiration_date != expiration_date {
            debug!(%checksum, expires_at = current.expiration_date, "cache entry replaced, kept");
            return Ok(false);
        }
        self.cache.remove(checksum.as_str().as_bytes())?;
        debug!(%checksum, "removed expired cache entry");
        Ok(true)
    }

    // ----- Capacity monitoring -----

    /// Store the monitoring bookkeeping of a scope.
    pub fn put_monitoring_run(&self, scope: &str, run: &MonitoringRun) -> Result<()> {
        let value = postcard::to_allocvec(run)?;
        self.monitoring.insert(scope.as_bytes(), value.as_slice())?;
        Ok(())
    }

    /// Retrieve the monitoring bookkeeping of a scope.
    pub fn get_monitoring_run(&self, scope: &str) -> Result<Option<MonitoringRun>> {
        match self.monitoring.get(scope.as_bytes())? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }
}
