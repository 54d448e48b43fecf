//! TOML configuration for the Shelf daemon.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use shelf_engine::ShelfEngineConfig;
use shelf_monitor::{MonitorError, Thresholds};
use shelf_types::{BackendKind, BackendSpec};

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Where persistent data lives.
    pub node: NodeSection,
    /// Restored-copy cache.
    pub cache: CacheSection,
    /// Availability requests.
    pub availability: AvailabilitySection,
    /// Capacity monitoring.
    pub monitor: MonitorSection,
    /// Backends to register at startup.
    #[serde(rename = "backend")]
    pub backends: Vec<BackendSection>,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Directory for persistent data (metadata DB).
    pub data_dir: PathBuf,
}

impl Default for NodeSection {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .map(|h| h.join(".shelf"))
            .unwrap_or_else(|| PathBuf::from(".shelf"));
        Self { data_dir }
    }
}

/// `[cache]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// How long a restored copy stays readable, in seconds.
    pub ttl_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self { ttl_secs: 86_400 }
    }
}

/// `[availability]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AvailabilitySection {
    /// Most checksums accepted in one request.
    pub max_bulk_size: usize,
}

impl Default for AvailabilitySection {
    fn default() -> Self {
        Self { max_bulk_size: 100 }
    }
}

/// `[monitor]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    /// Seconds between two scheduled passes.
    pub interval_secs: u64,
    /// Occupation that triggers a warning.
    pub warning_percent: u32,
    /// Occupation that puts the scope in maintenance.
    pub critical_percent: u32,
    /// Scopes monitored on every pass.
    pub scopes: Vec<String>,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            interval_secs: 3_600,
            warning_percent: 70,
            critical_percent: 90,
            scopes: vec!["default".to_string()],
        }
    }
}

/// One `[[backend]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendSection {
    /// Unique backend label.
    pub label: String,
    /// `"online"`, `"nearline"` or `"offline"`.
    pub kind: BackendKind,
    /// Whether new files may be sent to the backend.
    #[serde(default = "default_true")]
    pub active: bool,
    /// Capacity granted to the backend, in bytes.
    #[serde(default)]
    pub allowed_capacity_bytes: Option<u64>,
    /// Where restored copies are reported (nearline and offline backends).
    #[serde(default)]
    pub restore_dir: Option<PathBuf>,
    /// Plugin parameters.
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl BackendSection {
    /// The registration spec for this entry.
    pub fn spec(&self) -> BackendSpec {
        BackendSpec {
            label: self.label.clone(),
            kind: self.kind,
            active: self.active,
            allowed_capacity_bytes: self.allowed_capacity_bytes,
            settings: self.settings.clone(),
        }
    }
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or use defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                let config: CliConfig = toml::from_str(&content)?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Path of the metadata database.
    pub fn meta_path(&self) -> PathBuf {
        self.node.data_dir.join("meta")
    }

    /// Engine tunables.
    pub fn engine(&self) -> ShelfEngineConfig {
        ShelfEngineConfig {
            cache_ttl: Duration::from_secs(self.cache.ttl_secs),
            max_bulk_size: self.availability.max_bulk_size,
            ..ShelfEngineConfig::default()
        }
    }

    /// Validated monitor thresholds.
    pub fn thresholds(&self) -> Result<Thresholds, MonitorError> {
        Thresholds::new(self.monitor.warning_percent, self.monitor.critical_percent)
    }

    /// Time between two scheduled monitor passes.
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.interval_secs.max(1))
    }
}
