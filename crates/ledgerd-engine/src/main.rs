//! Event ledger daemon binary.
//!
//! Usage: `ledgerd-engine [config.yaml]`
//!
//! # Startup Sequence
//!
//! 1. Load configuration from the given path, else `ledgerd-config.yaml`,
//!    else defaults (environment overrides apply in every case)
//! 2. Initialize structured logging (tracing)
//! 3. Open the daemon: recover the data directory, start heartbeats
//! 4. Log a health line periodically until Ctrl-C
//! 5. Stop, flush, and close

mod error;

use std::path::PathBuf;
use std::time::Duration;

use ledgerd_core::{Daemon, DaemonConfig, LoggingConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::EngineError;

/// Default config file, relative to the working directory.
const DEFAULT_CONFIG_PATH: &str = "ledgerd-config.yaml";

/// How often the running daemon logs its health.
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Application entry point.
///
/// # Errors
///
/// Returns an error if configuration is invalid, recovery fails, or the
/// daemon cannot shut down cleanly.
#[tokio::main]
async fn main() -> Result<(), EngineError> {
    // 1. Load configuration.
    let (config, source) = load_config()?;

    // 2. Initialize structured logging.
    init_logging(&config.logging);
    info!(
        config = %source,
        data_dir = %config.data_dir.display(),
        heartbeat_interval_secs = config.heartbeat_interval_secs,
        auto_start = config.auto_start,
        "ledgerd-engine starting"
    );

    // 3. Open the daemon.
    let daemon = Daemon::open(config).await?;
    let recovery = daemon.ledger().recovery_report();
    info!(
        session_id = %daemon.session_id(),
        data_dir = %daemon.ledger().data_dir().display(),
        heartbeat_interval_secs = daemon.config().heartbeat_interval_secs,
        listener_timeout_ms = daemon.config().listener_timeout_ms,
        events_replayed = recovery.events_replayed,
        discarded_tail_bytes = recovery.discarded_tail_bytes,
        index_rows_restored = recovery.index_rows_restored,
        index_rows_pruned = recovery.index_rows_pruned,
        "Daemon ready"
    );

    // 4. Run until interrupted.
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut health_ticker = tokio::time::interval(HEALTH_LOG_INTERVAL);
    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(err) = result {
                    warn!(error = %err, "Signal handler failed; shutting down");
                }
                break;
            }
            _ = health_ticker.tick() => log_health(&daemon),
        }
    }

    // 5. Shut down.
    info!("Shutdown requested");
    log_health(&daemon);
    daemon.close().await?;
    info!("ledgerd-engine stopped");
    Ok(())
}

fn log_health(daemon: &Daemon) {
    let health = daemon.health();
    if health.is_healthy() || !health.running {
        info!(
            running = health.running,
            heartbeat_count = health.heartbeat_count,
            total_events = health.total_events,
            last_sequence_id = health.last_sequence_id,
            listener_count = health.listener_count,
            "Health"
        );
    } else {
        warn!(
            running = health.running,
            degraded = health.degraded,
            index_stale = health.index_stale,
            last_error = health.last_error.as_deref().unwrap_or(""),
            total_events = health.total_events,
            last_sequence_id = health.last_sequence_id,
            "Health degraded"
        );
    }
}

/// Resolve and load configuration.
///
/// An explicit path must exist. Without one, `ledgerd-config.yaml` is used
/// if present, otherwise defaults.
fn load_config() -> Result<(DaemonConfig, String), EngineError> {
    if let Some(path) = std::env::args_os().nth(1).map(PathBuf::from) {
        let config = DaemonConfig::from_file(&path)?;
        return Ok((config, path.display().to_string()));
    }

    let default_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    if default_path.exists() {
        let config = DaemonConfig::from_file(&default_path)?;
        return Ok((config, String::from(DEFAULT_CONFIG_PATH)));
    }

    let mut config = DaemonConfig::default();
    config.apply_env_overrides()?;
    config.validate()?;
    Ok((config, String::from("defaults")))
}

fn init_logging(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
