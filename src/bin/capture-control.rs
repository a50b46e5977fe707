//! Capture Control Plane
//!
//! Supervises one capture worker per session and serves the control
//! protocol to local and LAN clients.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_capture_control::{
    app::{restore_sessions, ControlPlane, LoopEvent, LoopHandle},
    config::{AppConfig, SettingsStore},
    session::{Poller, RegistryOptions, RootModel, SessionRegistry},
    worker::{ProcessDriver, WorkerDriver},
    ui::WebServer,
};

#[derive(Parser, Debug)]
#[command(name = "capture-control", version, about = "Audio capture control plane")]
struct Args {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Worker executable, overriding the configuration
    #[arg(short, long)]
    worker: Option<PathBuf>,

    /// Directory of static files for the web UI
    #[arg(long)]
    www: Option<PathBuf>,
}

#[cfg(unix)]
async fn hangup() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::hangup()) {
        Ok(mut hangups) => {
            hangups.recv().await;
        }
        Err(e) => {
            tracing::warn!("SIGHUP unavailable: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn hangup() {
    std::future::pending::<()>().await;
}

/// Re-read the security section of the settings file on every SIGHUP
async fn reload_security_on_hangup(store: SettingsStore, handle: LoopHandle) {
    loop {
        hangup().await;
        match store.load() {
            Ok(settings) => {
                tracing::info!("Reloading security settings");
                if !handle.send(LoopEvent::SecurityChanged(settings.websocket)) {
                    break;
                }
            }
            Err(e) => tracing::error!("Failed to reload settings: {}", e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => AppConfig::default_path()?,
    };
    let mut config = AppConfig::load(&config_path)?;
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }
    if let Some(worker) = args.worker {
        config.worker.executable = worker;
    }
    if let Some(www) = args.www {
        config.server.document_root = Some(www);
    }

    // Initialize logging
    let default_filter = config.log_filter.clone().unwrap_or_else(|| "info".into());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or(default_filter),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "Starting capture control plane v{} ({})",
        env!("CARGO_PKG_VERSION"),
        config_path.display()
    );

    let store = SettingsStore::new(config.resolve_settings_path(&config_path));
    let settings = store.load()?;
    tracing::info!(
        "Loaded {} session(s) from {}",
        settings.sessions.len(),
        store.path().display()
    );

    let (handle, events) = LoopHandle::channel();
    let hook = handle.clone();
    let driver: Arc<dyn WorkerDriver> = Arc::new(
        ProcessDriver::new(config.worker.clone()).with_starting_hook(Arc::new(move |session| {
            hook.send(LoopEvent::WorkerStarting(session));
        })),
    );

    // Devices first, so restored sessions bind and start right away
    let devices = match driver.list_devices().await {
        Ok(devices) => devices,
        Err(e) => {
            tracing::warn!("Initial device enumeration failed: {}", e);
            Vec::new()
        }
    };
    tracing::info!("Found {} audio device(s)", devices.len());

    let options = RegistryOptions {
        shm_prefix: Some(config.worker.shm_prefix.clone()),
        console_capacity: config.worker.console_capacity,
        network_sink_defaults: settings.network_sink_defaults.clone(),
        ..Default::default()
    };
    let poll_set = Default::default();
    let mut registry = SessionRegistry::new(driver, options, poll_set);
    registry.set_devices(devices);
    let restored = restore_sessions(&mut registry, settings.sessions);
    tracing::info!("Restored {} session(s)", restored);

    let poll_set = registry.poll_set().clone();
    let root = RootModel::new(registry, settings.websocket);
    let plane = ControlPlane::new(
        root,
        handle.clone(),
        events,
        config.timing.clone(),
        Some(store.clone()),
    );
    let poller = Poller::spawn(
        poll_set,
        Duration::from_millis(config.timing.poll_interval_ms.max(1)),
        plane.poll_sender(),
    )?;
    let control_plane = tokio::spawn(plane.run());

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let server = WebServer::new(config.server.clone(), handle.clone());
    let web_handle = server.start_background(async move {
        let _ = stop_rx.wait_for(|stopped| *stopped).await;
    });

    tokio::spawn(reload_security_on_hangup(store, handle.clone()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    let _ = stop_tx.send(true);
    let _ = web_handle.await;
    handle.send(LoopEvent::Shutdown);
    if let Err(e) = control_plane.await {
        tracing::error!("Control plane task failed: {}", e);
    }
    poller.stop();

    tracing::info!("Stopped");
    Ok(())
}
