//! `host-proxy serve|status|stop` subcommand wiring.

use anyhow::{Context, Result};

use crate::config::Config;
use crate::docker::{BollardContainerLister, ContainerFilter, ContainerLister};
use crate::proxy::{Daemon, Manager};

/// Runs the daemon in the foreground of the current process. The Manager
/// reaches this by spawning `host-proxy serve --port N` detached; `docker-proxy
/// serve` run directly from a terminal behaves identically, just attached.
pub async fn serve(port: Option<u16>) -> Result<()> {
    let mut config = Config::load().context("loading configuration")?;
    if let Some(port) = port {
        config.port = port;
    }

    let lister: std::sync::Arc<dyn ContainerLister> = std::sync::Arc::new(
        BollardContainerLister::connect().context("connecting to Docker")?,
    );
    let filter = ContainerFilter::default();

    let daemon = Daemon::new(config).await;
    let shutdown = shutdown_signal();

    log::info!("host proxy daemon starting");
    daemon.run(lister, filter, shutdown).await?;
    log::info!("host proxy daemon stopped");
    Ok(())
}

/// Reports whether a healthy `clawker-host-proxy` is reachable on the
/// configured port.
pub async fn status(port: Option<u16>) -> Result<()> {
    let mut config = Config::load().context("loading configuration")?;
    if let Some(port) = port {
        config.port = port;
    }

    let manager = Manager::new(config.clone());
    if manager.is_running().await {
        let pid_file = Config::host_proxy_pid_file().context("resolving PID file path")?;
        match crate::process::read_pid_file(&pid_file) {
            Some(pid) => println!("running (PID: {pid})"),
            None => println!("running (PID: unknown)"),
        }
    } else {
        println!("not running");
        std::process::exit(1);
    }
    Ok(())
}

/// Sends SIGTERM to whatever the PID file names, tolerating absence.
pub fn stop(port: Option<u16>) -> Result<()> {
    let mut config = Config::load().context("loading configuration")?;
    if let Some(port) = port {
        config.port = port;
    }

    let manager = Manager::new(config);
    manager.stop_daemon().context("stopping host proxy daemon")?;
    println!("host proxy stop requested");
    Ok(())
}

/// Resolves when SIGTERM or SIGINT arrives, for `Daemon::run`'s
/// `external_shutdown` future.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("registering SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("registering SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}
