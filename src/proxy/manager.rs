//! Host Proxy Manager: the client-facing entry point used by the CLI to
//! spawn, detect, and stop the daemon subprocess.

use tokio::sync::Mutex;

use crate::config::Config;
use crate::constants::{
    HEALTH_PROBE_TIMEOUT, MANAGER_HEALTH_POLL_INTERVAL, MANAGER_START_HEALTHY_BUDGET,
    SERVICE_IDENTIFIER,
};
use crate::error::{ClawkerError, Result};
use crate::process;

/// Client-facing entry point. Survives any single CLI invocation: it does
/// not own the daemon's lifecycle — the daemon does.
pub struct Manager {
    config: Config,
    http: reqwest::Client,
    // Process-wide mutex: serializes concurrent `ensure_running` calls
    // within this CLI invocation so two racing commands don't both decide
    // the port is free and both spawn a daemon.
    lock: Mutex<()>,
}

impl Manager {
    pub fn new(config: Config) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HEALTH_PROBE_TIMEOUT)
            .build()
            .expect("reqwest client builds with a static timeout");
        Self {
            config,
            http,
            lock: Mutex::new(()),
        }
    }

    fn health_url(&self) -> String {
        format!("http://127.0.0.1:{}/health", self.config.port)
    }

    /// `Ok(true)` iff a GET to `/health` on the configured port returns the
    /// `clawker-host-proxy` service identifier. Used both to detect our own
    /// daemon and to detect a hijacking foreign service.
    async fn health_check(&self) -> bool {
        let response = match self.http.get(self.health_url()).send().await {
            Ok(r) => r,
            Err(_) => return false,
        };
        match response.json::<serde_json::Value>().await {
            Ok(body) => body.get("service").and_then(|v| v.as_str()) == Some(SERVICE_IDENTIFIER),
            Err(_) => false,
        }
    }

    /// True iff the PID-file + health-check succeed, OR some live service
    /// with the clawker identifier is already on the port.
    pub async fn is_running(&self) -> bool {
        self.health_check().await
    }

    /// Returns `http://host.docker.internal:<port>`, the URL a container
    /// reaches the host proxy at.
    pub fn proxy_url(&self) -> String {
        format!("http://host.docker.internal:{}", self.config.port)
    }

    /// Ensures the daemon is reachable, spawning it if necessary.
    ///
    /// Under the process-wide mutex:
    /// 1. If already running (our daemon, by health check), return.
    /// 2. If the port is in use by something else, error.
    /// 3. Otherwise spawn `host-proxy serve --port N` detached, release
    ///    the child, and probe health every 100 ms for up to 3 s.
    pub async fn ensure_running(&self) -> Result<()> {
        let _guard = self.lock.lock().await;

        if self.health_check().await {
            return Ok(());
        }

        if port_in_use(self.config.port).await {
            return Err(ClawkerError::dependency(format!(
                "port {} is in use by a service that is not clawker-host-proxy",
                self.config.port
            )));
        }

        let current_exe = std::env::current_exe()
            .map_err(|e| ClawkerError::Fatal(format!("resolving current executable: {e}")))?;
        let log_path = Config::host_proxy_log_file()
            .map_err(|e| ClawkerError::Fatal(e.to_string()))?;

        process::spawn_detached(
            &current_exe,
            &[
                "host-proxy".to_string(),
                "serve".to_string(),
                "--port".to_string(),
                self.config.port.to_string(),
            ],
            &log_path,
        )
        .map_err(|e| ClawkerError::Fatal(format!("spawning host proxy daemon: {e}")))?;

        let deadline = tokio::time::Instant::now() + MANAGER_START_HEALTHY_BUDGET;
        while tokio::time::Instant::now() < deadline {
            if self.health_check().await {
                return Ok(());
            }
            tokio::time::sleep(MANAGER_HEALTH_POLL_INTERVAL).await;
        }

        Err(ClawkerError::dependency(
            "host proxy daemon did not become healthy within the startup budget",
        ))
    }

    /// Reads the PID file; SIGTERMs a live pid, or removes a stale file.
    pub fn stop_daemon(&self) -> Result<()> {
        let pid_file = Config::host_proxy_pid_file()?;
        match process::read_pid_file(&pid_file) {
            Some(pid) if process::is_alive(pid) => {
                process::terminate(pid)?;
            }
            Some(_) => {
                process::remove_pid_file(&pid_file);
            }
            None => {}
        }
        Ok(())
    }
}

async fn port_in_use(port: u16) -> bool {
    tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .is_err()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(port: u16) -> Config {
        Config {
            port,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn is_running_false_when_nothing_listens() {
        let manager = Manager::new(test_config(19501));
        assert!(!manager.is_running().await);
    }

    #[tokio::test]
    async fn ensure_running_no_respawn_when_already_healthy() {
        // Ground the S4/invariant-5-style guarantee at the Manager layer:
        // given an already-running service with the right identifier,
        // `ensure_running` must not attempt to spawn a second one (which
        // would otherwise fail the port bind and surface as an error).
        let config = test_config(19502);
        let server = crate::proxy::Server::new(&config).await;
        server.start().await.unwrap();

        let manager = Manager::new(config);
        manager.ensure_running().await.unwrap();

        server.stop_default().await.unwrap();
    }

    #[tokio::test]
    async fn ensure_running_reports_foreign_service_on_port() {
        let port = 19503;
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .unwrap();
        let foreign = tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    return;
                }
            }
        });

        let manager = Manager::new(test_config(port));
        let result = manager.ensure_running().await;
        assert!(result.is_err());
        foreign.abort();
    }

    #[test]
    fn stop_daemon_tolerates_missing_pid_file() {
        let manager = Manager::new(test_config(19504));
        assert!(manager.stop_daemon().is_ok());
    }

    #[test]
    fn proxy_url_uses_host_docker_internal() {
        let manager = Manager::new(test_config(18374));
        assert_eq!(manager.proxy_url(), "http://host.docker.internal:18374");
    }
}
