//! `SpeedData` Daemon
//!
//! Runs the channel registry, supervises one relay worker per channel and
//! serves the HTTP control plane.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use speeddata_core::config::load_config;
use speeddata_core::tracing_init::{filter_for, init_tracing};
use speeddata_daemon::api::{AppState, build_router};
use speeddata_daemon::storage::Database;
use speeddata_daemon::supervisor::{
    ChildLauncher, Supervisor, SupervisorPolicy, spawn_health_loop,
};

#[derive(Parser, Debug)]
#[command(name = "speeddata-daemon")]
#[command(version, about = "SpeedData daemon - telemetry relay fleet manager")]
struct Args {
    /// Fleet config file (TOML). Defaults to `config/speeddata.toml` if present.
    #[arg(long, env = "SPEEDDATA_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP control plane bind address
    #[arg(long, env = "SPEEDDATA_API_ADDR")]
    addr: Option<SocketAddr>,

    /// Registry database file path
    #[arg(long, env = "SPEEDDATA_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Directory relay workers write their logs to
    #[arg(long, env = "SPEEDDATA_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Path to the `speeddata-relay` worker binary
    #[arg(long, env = "SPEEDDATA_WORKER_BIN")]
    worker_bin: Option<PathBuf>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "SPEEDDATA_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "SPEEDDATA_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_filter = filter_for(
        &["speeddata_daemon", "speeddata_core", "tower_http"],
        &args.log_level,
    );
    init_tracing(&log_filter, args.log_json);

    let mut config = load_config(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.api.addr = addr;
    }
    if let Some(path) = args.db_path {
        config.storage.database_path = path;
    }
    if let Some(dir) = args.output_dir {
        config.storage.output_dir = dir;
    }
    if let Some(bin) = args.worker_bin {
        config.supervisor.worker_bin = bin;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.api.addr,
        baseline = config.channels.len(),
        "Starting speeddata-daemon"
    );

    info!(path = %config.storage.database_path.display(), "Opening registry");
    let db = Database::open(&config.storage.database_path).await?;
    std::fs::create_dir_all(&config.storage.output_dir)?;

    let worker_bin = resolve_worker_bin(&config.supervisor.worker_bin);
    if worker_bin.components().count() > 1 && !worker_bin.exists() {
        warn!(path = %worker_bin.display(), "Worker binary not found; spawns will fail");
    }

    let supervisor = Arc::new(Supervisor::new(
        db.clone(),
        Arc::new(ChildLauncher::new(config.supervisor.output_tail_lines)),
        worker_bin,
        config.relay_defaults(),
        SupervisorPolicy::from(&config.supervisor),
    ));

    let started = supervisor.start_all(&config.channels).await?;
    info!(started, "Baseline fleet up");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let health_handle = spawn_health_loop(Arc::clone(&supervisor), shutdown_rx);

    let app = build_router(AppState {
        db,
        supervisor: Arc::clone(&supervisor),
    });
    let listener = tokio::net::TcpListener::bind(config.api.addr).await?;

    // The `true` parameter unsets $NOTIFY_SOCKET so relay workers
    // don't accidentally notify systemd.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    info!(addr = %config.api.addr, "Control API ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = health_handle.await;
    supervisor.stop_all().await;

    info!("Daemon stopped");
    Ok(())
}

/// Prefer a worker binary installed next to the daemon when only a bare
/// name is configured.
fn resolve_worker_bin(configured: &Path) -> PathBuf {
    if configured.components().count() == 1 {
        if let Some(sibling) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(configured)))
            .filter(|p| p.exists())
        {
            return sibling;
        }
    }
    configured.to_path_buf()
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C shutdown signal"),
        () = sigterm => info!("Received SIGTERM shutdown signal"),
    }
}
