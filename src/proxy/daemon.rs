//! Host Proxy Daemon: wraps the Server with PID-file management and a
//! population watcher that self-terminates the daemon when no managed
//! containers remain (or Docker visibility is lost).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::config::Config;
use crate::docker::{ContainerFilter, ContainerLister};
use crate::error::Result;
use crate::process;

use super::Server;

/// Wraps `Server` with PID-file lifecycle and the population watcher.
pub struct Daemon {
    server: Arc<Server>,
    config: Config,
    shutdown: Arc<Notify>,
}

impl Daemon {
    pub async fn new(config: Config) -> Self {
        Self {
            server: Server::new(&config).await,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Runs until a shutdown signal arrives, the watcher decides to exit,
    /// or `external_shutdown` fires. Writes the PID file before starting
    /// the Server, and removes it on the way out regardless of cause.
    pub async fn run(
        &self,
        lister: Arc<dyn ContainerLister>,
        filter: ContainerFilter,
        external_shutdown: impl std::future::Future<Output = ()>,
    ) -> Result<()> {
        let pid_file = Config::host_proxy_pid_file()
            .map_err(|e| crate::error::ClawkerError::Fatal(e.to_string()))?;
        process::write_pid_file(&pid_file, std::process::id())
            .map_err(|e| crate::error::ClawkerError::Fatal(e.to_string()))?;

        self.server.start().await?;

        let watcher_shutdown = Arc::clone(&self.shutdown);
        let watcher_config = self.config.clone();
        let watcher_lister = Arc::clone(&lister);
        let watcher_handle = tokio::spawn(async move {
            population_watcher(watcher_config, watcher_lister, filter, watcher_shutdown).await;
        });

        tokio::select! {
            _ = self.shutdown.notified() => {
                log::info!("host proxy daemon shutting down (population watcher)");
            }
            _ = external_shutdown => {
                log::info!("host proxy daemon shutting down (signal)");
            }
        }

        watcher_handle.abort();
        self.server.stop_default().await?;
        lister.close().await;
        process::remove_pid_file(&pid_file);
        Ok(())
    }

    /// Requests shutdown, as if the population watcher had decided to exit.
    /// Exposed for the `stop` CLI subcommand's in-process path and for
    /// tests; the cross-process path is SIGTERM via `Manager::stop_daemon`.
    pub fn request_shutdown(&self) {
        self.shutdown.notify_one();
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }
}

/// After `grace_period`, polls `lister` every `poll_interval`. Zero
/// matching containers, or `max_consecutive_errs` consecutive API errors,
/// triggers `shutdown`.
async fn population_watcher(
    config: Config,
    lister: Arc<dyn ContainerLister>,
    filter: ContainerFilter,
    shutdown: Arc<Notify>,
) {
    tokio::time::sleep(config.watcher_grace_period()).await;

    let consecutive_errs = AtomicU32::new(0);
    let mut interval = tokio::time::interval(config.watcher_poll_interval());
    loop {
        interval.tick().await;

        match lister.list(&filter).await {
            Ok(containers) => {
                consecutive_errs.store(0, Ordering::SeqCst);
                if containers.is_empty() {
                    log::info!("no managed containers remain; shutting down");
                    shutdown.notify_one();
                    return;
                }
            }
            Err(e) => {
                let errs = consecutive_errs.fetch_add(1, Ordering::SeqCst) + 1;
                log::warn!("population watcher list error ({errs}/{}): {e}", config.max_consecutive_errs);
                if errs >= config.max_consecutive_errs {
                    log::warn!("max consecutive errors reached; shutting down");
                    shutdown.notify_one();
                    return;
                }
            }
        }
    }
}

/// Runs `population_watcher` directly, for tests that need to observe its
/// behavior without going through the full `Daemon::run` PID-file path.
#[cfg(test)]
pub async fn run_watcher_for_test(
    config: Config,
    lister: Arc<dyn ContainerLister>,
    filter: ContainerFilter,
) -> bool {
    use std::time::Duration;

    let shutdown = Arc::new(Notify::new());
    let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let watcher_fired = Arc::clone(&fired);
    let watcher_shutdown = Arc::clone(&shutdown);
    tokio::spawn(async move {
        population_watcher(config, lister, filter, watcher_shutdown).await;
    });
    tokio::select! {
        _ = shutdown.notified() => {
            watcher_fired.store(true, Ordering::SeqCst);
        }
        _ = tokio::time::sleep(Duration::from_secs(2)) => {}
    }
    fired.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::FakeLister;
    use std::sync::atomic::AtomicU32 as StdAtomicU32;

    fn config(grace_ms: u64, poll_ms: u64, max_errs: u32) -> Config {
        Config {
            watcher_grace_period_ms: grace_ms,
            watcher_poll_interval_ms: poll_ms,
            max_consecutive_errs: max_errs,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn s3_population_based_shutdown() {
        let lister: Arc<dyn ContainerLister> = Arc::new(FakeLister {
            containers: std::sync::Mutex::new(vec![]),
            always_err: false,
            calls: StdAtomicU32::new(0),
        });
        let cfg = config(50, 10, 10);
        let fired = run_watcher_for_test(cfg, lister, ContainerFilter::default()).await;
        assert!(fired);
    }

    #[tokio::test]
    async fn s4_consecutive_error_shutdown_after_exactly_max_errs() {
        let lister_inner = Arc::new(FakeLister {
            containers: std::sync::Mutex::new(vec![]),
            always_err: true,
            calls: StdAtomicU32::new(0),
        });
        let lister: Arc<dyn ContainerLister> = Arc::clone(&lister_inner) as Arc<dyn ContainerLister>;
        let cfg = config(0, 5, 5);
        let fired = run_watcher_for_test(cfg, lister, ContainerFilter::default()).await;
        assert!(fired);
        assert_eq!(lister_inner.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn non_empty_population_keeps_daemon_alive() {
        let lister: Arc<dyn ContainerLister> = Arc::new(FakeLister {
            containers: std::sync::Mutex::new(vec![crate::docker::Container {
                id: "abc".to_string(),
                names: vec!["/agent-1".to_string()],
            }]),
            always_err: false,
            calls: StdAtomicU32::new(0),
        });
        let cfg = config(0, 10, 10);
        let fired = run_watcher_for_test(cfg, lister, ContainerFilter::default()).await;
        assert!(!fired);
    }
}
