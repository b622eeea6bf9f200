//! `SpeedData` Relay Worker
//!
//! Serves one channel: receives datagrams on the channel's UDP port,
//! republishes them to the full-rate and decimated multicast groups and
//! appends every one to a rotating record log.

use clap::Parser;
use tracing::{error, info, warn};

use speeddata_core::tracing_init::{filter_for, init_tracing};
use speeddata_relay::{Relay, RelayArgs};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = RelayArgs::parse();

    let log_filter = filter_for(&["speeddata_relay", "speeddata_core"], &args.log_level);
    init_tracing(&log_filter, args.log_json);

    let settings = args.into_settings()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        channel = %settings.name,
        port = settings.rx_port,
        output_dir = %settings.output_dir.display(),
        "Starting speeddata-relay"
    );

    let relay = Relay::bind(settings).await?;
    match relay.run(shutdown_signal()).await {
        Ok(_) => Ok(()),
        Err(e) => {
            error!(error = %e, "Relay failed");
            Err(e.into())
        }
    }
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
