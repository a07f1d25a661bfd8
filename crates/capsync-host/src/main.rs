//! CapSync capture host entry point.
//!
//! Loads the configuration, starts the host, logs every event, and runs
//! until Ctrl-C.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load_config()          -- CAPSYNC_CONFIG or the platform config file
//!  └─ CaptureHost::start()
//!       ├─ accept loop        (one receive + one send loop per device)
//!       ├─ heartbeat sweep
//!       ├─ stale-sensor sweep
//!       ├─ adaptive-load tick
//!       └─ discovery responder (UDP background thread)
//! ```

use anyhow::Context;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use capsync_host::application::events::HostEvent;
use capsync_host::infrastructure::host::CaptureHost;
use capsync_host::infrastructure::storage::config::{config_file_path, load_config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config().context("loading configuration")?;

    // `RUST_LOG` wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.host.log_level)),
        )
        .init();

    match config_file_path() {
        Ok(path) => info!("CapSync host starting (config: {})", path.display()),
        Err(_) => info!("CapSync host starting (default config)"),
    }

    let host = CaptureHost::start(config)
        .await
        .context("starting capture host")?;

    host.events().subscribe(|event: &HostEvent| {
        log_event(event);
        Ok(())
    });
    if let Some(tokens) = host.tokens() {
        info!("token authentication enabled; bootstrap token: {}", tokens.issue(None));
    }

    info!("CapSync host ready on {}.  Press Ctrl-C to exit.", host.local_addr());

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!("failed to listen for Ctrl-C: {e}"),
    }

    host.shutdown().await;
    info!("CapSync host stopped");
    Ok(())
}

fn log_event(event: &HostEvent) {
    match event {
        HostEvent::DeviceConnected {
            device_id,
            capabilities,
        } => info!("device {device_id} connected {capabilities:?}"),
        HostEvent::DeviceDisconnected { device_id, reason } => {
            info!("device {device_id} disconnected: {reason}")
        }
        HostEvent::SessionStarted(session) => info!(
            "session {} started on {} device(s)",
            session.id,
            session.devices.len()
        ),
        HostEvent::SessionStopped(session) => info!(
            "session {} stopped with {} sample(s)",
            session.id, session.sample_count
        ),
        HostEvent::FileReceived {
            device_id,
            name,
            data,
            ..
        } => info!("device {device_id}: received {name} ({} bytes)", data.len()),
        HostEvent::FileRejected {
            device_id,
            name,
            reason,
        } => warn!("device {device_id}: rejected {name}: {reason}"),
        HostEvent::DataStale {
            device_id,
            silent_for,
        } => warn!("device {device_id}: sensor data stale for {silent_for:?}"),
        HostEvent::PerformanceLevelChanged { from, to } => {
            info!("performance level {from} -> {to}")
        }
        other => debug!("event: {}", other.name()),
    }
}
