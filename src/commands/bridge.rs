//! `bridge serve` subcommand wiring: the detached process the Socket
//! Bridge Manager spawns for one container.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use bollard::query_parameters::EventsOptionsBuilder;
use bollard::Docker;
use futures_util::StreamExt;

use crate::bridge::SocketBridge;
use crate::process;

/// Writes its own PID file, starts the socket bridge, then blocks until
/// the container stops running (a third layer of defence alongside the
/// CLI's own stop/remove hooks and the Manager's stale-PID detection).
pub async fn serve(container: String, pid_file: PathBuf, gpg: bool) -> Result<()> {
    process::write_pid_file(&pid_file, std::process::id()).context("writing bridge PID file")?;

    let gpg_key = if gpg {
        Some(
            export_gpg_public_key()
                .await
                .context("exporting GPG public key")?,
        )
    } else {
        None
    };

    log::info!("bridge starting for container {container}");
    let bridge = SocketBridge::start(&container, gpg, gpg_key)
        .await
        .context("starting socket bridge")?;
    log::info!("bridge ready for container {container}");

    wait_for_container_exit(&container).await;

    log::info!("bridge stopping for container {container}");
    bridge.stop().await;
    process::remove_pid_file(&pid_file);
    Ok(())
}

async fn export_gpg_public_key() -> Result<Vec<u8>> {
    let output = tokio::process::Command::new("gpg")
        .arg("--export")
        .output()
        .await
        .context("running gpg --export")?;
    if !output.status.success() {
        anyhow::bail!("gpg --export exited non-zero");
    }
    Ok(output.stdout)
}

/// Waits for the container to stop. Primarily driven by a Docker events
/// subscription filtered to this container's `die` event; a once-a-second
/// inspect poll runs alongside as a fallback in case the event stream
/// drops or a `die` event is missed (e.g. a daemon restart mid-stream).
async fn wait_for_container_exit(container: &str) {
    let docker = match Docker::connect_with_local_defaults() {
        Ok(d) => d,
        Err(e) => {
            log::warn!("cannot watch container {container} for exit: {e}");
            return;
        }
    };

    tokio::select! {
        _ = watch_die_event(&docker, container) => {
            log::info!("container {container} died (event stream)");
        }
        _ = poll_until_not_running(&docker, container) => {
            log::info!("container {container} is no longer running (poll fallback)");
        }
    }
}

/// Subscribes to `/events` filtered to `type=container` + `event=die` +
/// this container's ID, resolving on the first matching event or when the
/// stream ends (daemon disconnect).
async fn watch_die_event(docker: &Docker, container: &str) {
    let mut filters = HashMap::new();
    filters.insert("type".to_string(), vec!["container".to_string()]);
    filters.insert("event".to_string(), vec!["die".to_string()]);
    filters.insert("container".to_string(), vec![container.to_string()]);

    let options = EventsOptionsBuilder::new().filters(&filters).build();
    let mut stream = docker.events(Some(options));

    match stream.next().await {
        Some(Ok(_)) => {}
        Some(Err(e)) => log::warn!("container {container} event stream error: {e}"),
        None => log::warn!("container {container} event stream ended unexpectedly"),
    }
}

/// Polls the container's running state every second until it stops
/// existing or stops running. Fallback for `watch_die_event`.
async fn poll_until_not_running(docker: &Docker, container: &str) {
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        match docker
            .inspect_container(
                container,
                None::<bollard::query_parameters::InspectContainerOptions>,
            )
            .await
        {
            Ok(info) => {
                let running = info.state.and_then(|s| s.running).unwrap_or(false);
                if !running {
                    return;
                }
            }
            Err(_) => return,
        }
    }
}
