//! `shelfd`: the Shelf daemon.
//!
//! Binary entrypoint that ties the registry, engine and capacity monitor
//! together over the backends listed in the config file.
//!
//! # Usage
//!
//! ```text
//! shelfd start                          # run the monitor scheduler
//! shelfd start -c shelf.toml            # start with a config file
//! shelfd backends                       # list backends by tier
//! shelfd backends up tape-2             # move a backend one step up
//! shelfd backends purge disk-1 --force  # delete every file of a backend
//! shelfd availability <checksum>...     # resolve file availability
//! shelfd monitor --scope tenant-a       # one capacity monitor run
//! ```

mod alerts;
mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shelf_engine::ShelfEngine;
use shelf_meta::MetaStore;
use shelf_monitor::{CapacityMonitor, CapacityReport, MonitorScheduler, StaticScopes};
use shelf_registry::BackendRegistry;
use shelf_store::MemoryPlugin;
use shelf_types::events::{CapacityThresholdCrossed, EventBus, NearlineConfirmed};
use shelf_types::{BackendId, BackendKind, BackendSpec, Checksum};
use tracing::{debug, error, info, warn};

use alerts::{LogMaintenance, LogNotifier};
use config::{BackendSection, CliConfig};

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "shelfd", version, about = "Shelf storage orchestration daemon")]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true, env = "SHELF_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon and its capacity monitor scheduler.
    Start {
        /// Override data directory.
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },

    /// Inspect or reorder backends.
    Backends {
        #[command(subcommand)]
        action: Option<BackendCommands>,
    },

    /// Resolve whether files can be read right now.
    Availability {
        /// Checksums to resolve.
        #[arg(required = true)]
        checksums: Vec<String>,
    },

    /// Run the capacity monitor once.
    Monitor {
        /// Scope to run for. Defaults to every configured scope.
        #[arg(short, long)]
        scope: Option<String>,
    },
}

#[derive(Subcommand)]
enum BackendCommands {
    /// List backends by tier and priority.
    List,
    /// Move a backend one step up within its tier.
    Up {
        /// Backend label.
        label: String,
    },
    /// Move a backend one step down within its tier.
    Down {
        /// Backend label.
        label: String,
    },
    /// Remove a backend that holds no files.
    Remove {
        /// Backend label.
        label: String,
    },
    /// Delete every file stored on a backend.
    Purge {
        /// Backend label.
        label: String,
        /// Drop references even when physical deletion fails.
        #[arg(long)]
        force: bool,
    },
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    setup_tracing(&config.log.level);

    match cli.command {
        Commands::Start { data_dir } => {
            if let Some(dir) = data_dir {
                config.node.data_dir = dir;
            }
            cmd_start(config).await
        }
        Commands::Backends { action } => {
            cmd_backends(&config, action.unwrap_or(BackendCommands::List)).await
        }
        Commands::Availability { checksums } => cmd_availability(&config, checksums).await,
        Commands::Monitor { scope } => cmd_monitor(&config, scope).await,
    }
}

/// Initialize the `tracing` subscriber with the given level filter.
///
/// Respects `RUST_LOG` env var if set, otherwise uses the config value.
fn setup_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

// -----------------------------------------------------------------------
// shelfd start
// -----------------------------------------------------------------------

async fn cmd_start(config: CliConfig) -> Result<()> {
    info!("starting shelfd");
    info!(
        data_dir = %config.node.data_dir.display(),
        backends = config.backends.len(),
        cache_ttl_secs = config.cache.ttl_secs,
        monitor_interval_secs = config.monitor.interval_secs,
        "node configuration"
    );

    let registry = open_registry(&config)?;
    let events = EventBus::new();
    let engine = ShelfEngine::new(registry.clone(), events.clone(), config.engine());
    debug!(?engine, "engine ready");

    let monitor = Arc::new(build_monitor(&config, registry, events.clone())?);
    let scheduler = MonitorScheduler::new(
        monitor,
        Arc::new(StaticScopes::new(config.monitor.scopes.clone())),
        config.monitor_interval(),
    );
    let scheduler_task = tokio::spawn(async move { scheduler.run().await });
    let events_task = tokio::spawn(log_events(events));

    info!(scopes = ?config.monitor.scopes, "shelfd ready");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("shutting down");
    scheduler_task.abort();
    events_task.abort();
    Ok(())
}

/// Mirror alert events into the log.
async fn log_events(events: EventBus) {
    let mut crossed = events.subscribe::<CapacityThresholdCrossed>();
    let mut confirmed = events.subscribe::<NearlineConfirmed>();
    loop {
        tokio::select! {
            Some(event) = crossed.recv() => {
                info!(
                    scope = %event.scope,
                    backend = %event.backend_label,
                    occupation = event.occupation_percent,
                    level = ?event.level,
                    "capacity threshold crossed"
                );
            }
            Some(event) = confirmed.recv() => {
                info!(checksum = %event.checksum, backend = %event.backend_label, "nearline file unavailable");
            }
            else => break,
        }
    }
}

// -----------------------------------------------------------------------
// shelfd backends
// -----------------------------------------------------------------------

const PURGE_TIMEOUT: Duration = Duration::from_secs(30);

async fn cmd_backends(config: &CliConfig, action: BackendCommands) -> Result<()> {
    let registry = open_registry(config)?;

    match action {
        BackendCommands::List => {}
        BackendCommands::Up { label } => {
            registry
                .increase_priority(&BackendId::from_label(&label))
                .with_context(|| format!("cannot move {label} up"))?;
        }
        BackendCommands::Down { label } => {
            registry
                .decrease_priority(&BackendId::from_label(&label))
                .with_context(|| format!("cannot move {label} down"))?;
        }
        BackendCommands::Remove { label } => {
            let removed = registry
                .delete(&BackendId::from_label(&label))
                .with_context(|| format!("cannot remove {label}"))?;
            println!("Removed {} ({})", removed.label, removed.kind);
        }
        BackendCommands::Purge { label, force } => {
            let engine = ShelfEngine::new(registry.clone(), EventBus::new(), config.engine());
            let submission = engine
                .delete_files(&label, force)
                .with_context(|| format!("cannot purge {label}"))?;
            let ids = submission.join().await;
            let outcomes = engine.await_outcomes(&ids, PURGE_TIMEOUT).await;
            let deleted = outcomes.iter().filter(|o| o.is_success()).count();
            println!(
                "Purged {label}: {deleted} deleted, {} failed, {} unresolved",
                outcomes.len() - deleted,
                ids.len() - outcomes.len(),
            );
        }
    }

    for kind in BackendKind::ALL {
        let backends = registry.list_by_kind(kind);
        println!("{kind}: {}", backends.len());
        for b in &backends {
            let allowed = b
                .allowed_capacity_bytes
                .map_or_else(|| "unbounded".to_string(), |a| a.to_string());
            println!(
                "  {} {} active={} used={}/{} files={} physical_deletion={}",
                b.priority,
                b.label,
                b.active,
                b.used_capacity_bytes,
                allowed,
                b.file_count,
                registry.allow_physical_deletion(&b.label),
            );
        }
    }
    Ok(())
}

// -----------------------------------------------------------------------
// shelfd availability
// -----------------------------------------------------------------------

async fn cmd_availability(config: &CliConfig, checksums: Vec<String>) -> Result<()> {
    let registry = open_registry(config)?;
    let engine = ShelfEngine::new(registry, EventBus::new(), config.engine());

    let wanted: Vec<Checksum> = checksums.into_iter().map(Checksum::new).collect();
    let statuses = engine
        .check_availability(&wanted)
        .await
        .context("availability check failed")?;

    for status in &statuses {
        match (status.available, status.expires_at) {
            (true, Some(at)) => println!("{} available until {at}", status.checksum),
            (true, None) => println!("{} available", status.checksum),
            (false, _) => println!("{} unavailable", status.checksum),
        }
    }
    let unknown = wanted.len().saturating_sub(statuses.len());
    if unknown > 0 {
        println!("{unknown} checksum(s) not referenced");
    }
    Ok(())
}

// -----------------------------------------------------------------------
// shelfd monitor
// -----------------------------------------------------------------------

async fn cmd_monitor(config: &CliConfig, scope: Option<String>) -> Result<()> {
    let registry = open_registry(config)?;
    let monitor = build_monitor(config, registry, EventBus::new())?;

    let scopes = match scope {
        Some(scope) => vec![scope],
        None => config.monitor.scopes.clone(),
    };
    for scope in scopes {
        let report = monitor
            .run(&scope)
            .await
            .with_context(|| format!("monitor run failed for scope {scope}"))?;
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &CapacityReport) {
    println!(
        "Scope {} ({} ms){}",
        report.scope,
        report.duration_ms,
        if report.maintenance { " MAINTENANCE" } else { "" },
    );
    for b in &report.backends {
        let ratio = b
            .occupation_percent
            .map_or_else(|| "-".to_string(), |r| format!("{r:.2}%"));
        let level = b.level.map_or_else(String::new, |l| format!(" {l:?}"));
        println!(
            "  {} [{}] used={} files={} occupation={ratio}{level}",
            b.label, b.kind, b.used_bytes, b.file_count,
        );
    }
}

// -----------------------------------------------------------------------
// Wiring
// -----------------------------------------------------------------------

/// Open the metadata store and registry, then bind the configured backends.
fn open_registry(config: &CliConfig) -> Result<Arc<BackendRegistry>> {
    std::fs::create_dir_all(&config.node.data_dir).context("failed to create data directory")?;
    let meta_path = config.meta_path();

    let meta = MetaStore::open(&meta_path).map_err(|e| {
        error!(path = %meta_path.display(), %e, "failed to open metadata store");
        anyhow::anyhow!(
            "cannot open metadata at {}. Is another shelfd using it? ({e})",
            meta_path.display(),
        )
    })?;

    let registry =
        Arc::new(BackendRegistry::open(Arc::new(meta)).context("failed to load backends")?);
    for section in &config.backends {
        bind_backend(&registry, section)
            .with_context(|| format!("failed to set up backend {}", section.label))?;
    }
    Ok(registry)
}

/// Register `section`, or re-attach a plugin to it if already registered.
fn bind_backend(registry: &BackendRegistry, section: &BackendSection) -> Result<()> {
    let mut plugin = MemoryPlugin::new(section.kind);
    if let Some(dir) = &section.restore_dir {
        plugin = plugin.with_restore_dir(dir.clone());
    }
    let plugin = Arc::new(plugin);

    let wanted = section.spec();
    let Some(existing) = registry.get_by_label(&section.label) else {
        registry.register(wanted, plugin)?;
        return Ok(());
    };

    registry.attach_plugin(&section.label, plugin)?;
    if BackendSpec::from(&existing) != wanted {
        match registry.update(&existing.id, wanted) {
            Ok(updated) => info!(label = %updated.label, "backend configuration updated"),
            Err(e) => warn!(label = %section.label, error = %e, "keeping stored backend configuration"),
        }
    }
    Ok(())
}

fn build_monitor(
    config: &CliConfig,
    registry: Arc<BackendRegistry>,
    events: EventBus,
) -> Result<CapacityMonitor> {
    let thresholds = config.thresholds().context("invalid [monitor] thresholds")?;
    Ok(CapacityMonitor::new(
        registry,
        Arc::new(LogNotifier),
        Arc::new(LogMaintenance::default()),
        events,
        thresholds,
    ))
}
