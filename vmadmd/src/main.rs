mod cli;
mod config;
mod control;
mod display;
mod host;
mod hypervisor;
mod metrics;
mod provision;
mod reconciler;
mod restart;
mod state_waiter;
mod store;
#[cfg(test)]
mod testing;
mod timers;
mod zone;

use std::fs::File;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use crate::config::Config;
use crate::control::http::{build_router, ApiState, ListenAddr};
use crate::control::{ControlDispatcher, StopTimers};
use crate::display::DisplaySessionManager;
use crate::hypervisor::QmpControl;
use crate::metrics::MetricsRegistry;
use crate::reconciler::Reconciler;
use crate::state_waiter::StateWaiter;
use crate::store::VmadmStore;
use crate::zone::events::{ZoneEventSource, ZoneeventCommand};

/// How long the control surface gets to drain after shutdown is requested.
const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "vmadmd", about = "Per-host VM lifecycle daemon for SmartOS zones")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon: reconcile zone events and serve the control surface.
    Serve {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Verify all prerequisites before running 'serve'. Exits 0 if all pass.
    Check {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config: config_path } => {
            let config = cli::load_config(config_path)?;
            cli::run_check(&config)?;
        }
        Commands::Serve { config: config_path } => {
            let config = cli::load_config(config_path)?;
            let default_filter = config.log_level.clone().unwrap_or_else(|| "info".to_string());
            let filter_handle = init_tracing(&default_filter);
            spawn_debug_toggle(filter_handle, default_filter);
            serve(config).await?;
        }
    }

    Ok(())
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(default_filter: &str) -> FilterHandle {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let (filter, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
    handle
}

/// SIGUSR1 flips between debug logging and the configured filter.
fn spawn_debug_toggle(handle: FilterHandle, default_filter: String) {
    let mut usr1 = match signal(SignalKind::user_defined1()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to register SIGUSR1 handler, debug toggle disabled");
            return;
        }
    };
    tokio::spawn(async move {
        let mut debug = false;
        while usr1.recv().await.is_some() {
            debug = !debug;
            let next = if debug { "debug" } else { default_filter.as_str() };
            match handle.modify(|filter| *filter = EnvFilter::new(next)) {
                Ok(()) => info!(filter = next, "log filter changed"),
                Err(e) => warn!(error = %e, "failed to change log filter"),
            }
        }
    });
}

/// Take the exclusive instance lock. The returned file must stay open for
/// as long as the daemon runs.
fn acquire_instance_lock(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .with_context(|| format!("failed to open instance lock file {}", path.display()))?;
    use std::os::unix::io::AsRawFd;
    let fd = lock_file.as_raw_fd();
    let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if result != 0 {
        anyhow::bail!(
            "Another vmadmd instance is already running (lock held on {}).\n\
             Two daemons would both act on every zone event. Stop the other instance first.",
            path.display()
        );
    }
    Ok(lock_file)
}

fn listen_addr(config: &Config) -> Result<ListenAddr> {
    match &config.server.http_addr {
        Some(addr) => {
            let addr: SocketAddr = addr
                .parse()
                .with_context(|| format!("invalid server.http_addr: {}", addr))?;
            Ok(ListenAddr::Tcp(addr))
        }
        None => Ok(ListenAddr::Unix(config.server.socket_path.clone())),
    }
}

async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, initiating shutdown");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, initiating shutdown");
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    let _lock = acquire_instance_lock(&config.server.lock_file)?;
    info!("vmadmd starting with config: {:?}", config);

    let metrics = MetricsRegistry::new();
    let store: Arc<dyn store::VmStore> = Arc::new(
        VmadmStore::new(config.zones.vmadm_binary.clone(), config.zones.zonecfg_binary.clone())
            .with_zones_root(config.zones.zones_root.clone()),
    );
    let hypervisor: Arc<dyn hypervisor::HypervisorControl> =
        Arc::new(QmpControl::new(config.hypervisor.command_timeout()));

    let display_host = host::resolve_display_host(&config.display).await?;
    let displays = Arc::new(DisplaySessionManager::new(
        display_host,
        Arc::clone(&hypervisor),
        metrics.clone(),
    ));
    let stop_timers = StopTimers::new();
    let waiter = StateWaiter::new();

    // Subscribe before the inventory pass so no transition slips between them.
    let events = ZoneeventCommand::new(config.zones.zoneevent_binary.clone())
        .subscribe()
        .await
        .context("failed to subscribe to zone events")?;

    let mut reconciler = Reconciler::new(
        Arc::clone(&store),
        Arc::clone(&displays),
        stop_timers.clone(),
        waiter.clone(),
        metrics.clone(),
        &config,
    );
    if let Err(e) = reconciler.startup(&config.server.autoboot_marker).await {
        warn!(error = %format!("{:#}", e), "startup inventory pass failed, continuing on events alone");
    }
    let mut reconciler_task = tokio::spawn(reconciler.run(events));

    let api = Arc::new(ApiState {
        control: ControlDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&hypervisor),
            Arc::clone(&displays),
            stop_timers.clone(),
            waiter,
        ),
        metrics,
    });
    let router = build_router(api);
    let listen = listen_addr(&config)?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let mut server_task = tokio::spawn(async move {
        control::http::serve(router, &listen, async {
            let _ = shutdown_rx.await;
        })
        .await
    });

    info!("vmadmd ready");

    let outcome = tokio::select! {
        result = &mut reconciler_task => match result {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("reconciler task panicked: {}", e)),
        },
        result = &mut server_task => match result {
            Ok(Ok(())) => Err(anyhow::anyhow!("control surface stopped unexpectedly")),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(anyhow::anyhow!("control surface task panicked: {}", e)),
        },
        _ = shutdown_signal() => Ok(()),
    };

    // Always tear down display sessions and timers, whatever ended the loop.
    let _ = shutdown_tx.send(());
    reconciler_task.abort();
    if !server_task.is_finished()
        && tokio::time::timeout(SERVER_DRAIN_TIMEOUT, &mut server_task).await.is_err()
    {
        warn!("control surface did not drain in time");
        server_task.abort();
    }
    stop_timers.cancel_all();
    displays.stop_all().await;

    match &outcome {
        Ok(()) => info!("vmadmd shut down"),
        Err(e) => error!(error = %format!("{:#}", e), "vmadmd exiting on error"),
    }
    outcome
}
