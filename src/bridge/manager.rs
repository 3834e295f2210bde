//! Socket Bridge Manager: a mutex-guarded `containerID -> Bridge Process
//! Record` map backed by a per-container PID-file convention, so the
//! bridge subprocess's lifetime is trackable across CLI invocations.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::Config;
use crate::constants::BRIDGE_PID_FILE_WAIT;
use crate::error::{ClawkerError, Result};
use crate::process;

struct BridgeRecord {
    pid: u32,
    pid_file: PathBuf,
}

/// Owns the bridge subprocess lifecycle: each record names one `bridge
/// serve` process, keyed by the container ID it attaches to.
pub struct BridgeManager {
    records: Mutex<HashMap<String, BridgeRecord>>,
}

impl BridgeManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(HashMap::new()),
        })
    }

    fn pid_file_for(container_id: &str) -> Result<PathBuf> {
        Ok(Config::bridges_dir()
            .map_err(|e| ClawkerError::Fatal(e.to_string()))?
            .join(format!("{container_id}.pid")))
    }

    fn log_file_for(container_id: &str) -> Result<PathBuf> {
        Ok(Config::bridge_logs_dir()
            .map_err(|e| ClawkerError::Fatal(e.to_string()))?
            .join(format!("bridge-{container_id}.log")))
    }

    /// 1. Tracked and alive → return.
    /// 2. Tracked but stale → clean up, fall through.
    /// 3. Untracked PID file names a live process → adopt.
    /// 4. Otherwise spawn `bridge serve --container ID --pid-file P [--gpg]`
    ///    and wait up to 5s for the PID file to appear.
    pub async fn ensure_bridge(&self, container_id: &str, gpg_enabled: bool) -> Result<()> {
        let mut records = self.records.lock().await;

        if let Some(record) = records.get(container_id) {
            if process::is_alive(record.pid) {
                return Ok(());
            }
            process::remove_pid_file(&record.pid_file);
            records.remove(container_id);
        }

        let pid_file = Self::pid_file_for(container_id)?;
        if let Some(pid) = process::read_pid_file(&pid_file) {
            if process::is_alive(pid) {
                records.insert(
                    container_id.to_string(),
                    BridgeRecord {
                        pid,
                        pid_file: pid_file.clone(),
                    },
                );
                return Ok(());
            }
            process::remove_pid_file(&pid_file);
        }

        let current_exe = std::env::current_exe()
            .map_err(|e| ClawkerError::Fatal(format!("resolving current executable: {e}")))?;
        let log_file = Self::log_file_for(container_id)?;

        let mut args = vec![
            "bridge".to_string(),
            "serve".to_string(),
            "--container".to_string(),
            container_id.to_string(),
            "--pid-file".to_string(),
            pid_file.to_string_lossy().into_owned(),
        ];
        if gpg_enabled {
            args.push("--gpg".to_string());
        }

        process::spawn_detached(&current_exe, &args, &log_file)
            .map_err(|e| ClawkerError::Fatal(format!("spawning bridge subprocess: {e}")))?;

        let deadline = tokio::time::Instant::now() + BRIDGE_PID_FILE_WAIT;
        loop {
            if let Some(pid) = process::read_pid_file(&pid_file) {
                records.insert(
                    container_id.to_string(),
                    BridgeRecord {
                        pid,
                        pid_file: pid_file.clone(),
                    },
                );
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClawkerError::dependency(format!(
                    "bridge for {container_id} did not write its PID file within the startup budget"
                )));
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }

    /// Cleans the in-memory record (SIGTERM if alive, remove PID file) and
    /// also SIGTERMs whatever the on-disk PID file names, for the
    /// cross-process case where another invocation tracks it.
    pub async fn stop_bridge(&self, container_id: &str) -> Result<()> {
        let mut records = self.records.lock().await;
        if let Some(record) = records.remove(container_id) {
            if process::is_alive(record.pid) {
                process::terminate(record.pid)?;
            }
            process::remove_pid_file(&record.pid_file);
        }

        let pid_file = Self::pid_file_for(container_id)?;
        if let Some(pid) = process::read_pid_file(&pid_file) {
            if process::is_alive(pid) {
                process::terminate(pid)?;
            }
            process::remove_pid_file(&pid_file);
        }
        Ok(())
    }

    /// Stops every in-memory record, then scans the PID-file directory for
    /// any stragglers left behind by other invocations.
    pub async fn stop_all(&self) -> Result<()> {
        let container_ids: Vec<String> = self.records.lock().await.keys().cloned().collect();
        for id in container_ids {
            self.stop_bridge(&id).await?;
        }

        let bridges_dir = Config::bridges_dir().map_err(|e| ClawkerError::Fatal(e.to_string()))?;
        let entries = std::fs::read_dir(&bridges_dir)
            .map_err(|e| ClawkerError::Fatal(format!("reading {bridges_dir:?}: {e}")))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pid") {
                continue;
            }
            if let Some(pid) = process::read_pid_file(&path) {
                if process::is_alive(pid) {
                    process::terminate(pid)?;
                }
            }
            process::remove_pid_file(&path);
        }
        Ok(())
    }

    /// True iff either the in-memory pid or the on-disk pid is alive.
    pub async fn is_running(&self, container_id: &str) -> Result<bool> {
        if let Some(record) = self.records.lock().await.get(container_id) {
            if process::is_alive(record.pid) {
                return Ok(true);
            }
        }
        let pid_file = Self::pid_file_for(container_id)?;
        Ok(process::read_pid_file(&pid_file).is_some_and(process::is_alive))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn is_running_false_for_unknown_container() {
        let manager = BridgeManager::new();
        assert!(!manager.is_running("no-such-container").await.unwrap());
    }

    #[tokio::test]
    async fn stop_bridge_tolerates_unknown_container() {
        let manager = BridgeManager::new();
        assert!(manager.stop_bridge("no-such-container").await.is_ok());
    }

    #[tokio::test]
    async fn adopts_live_process_named_by_an_existing_pid_file() {
        let manager = BridgeManager::new();
        let pid_file = BridgeManager::pid_file_for("adopt-me").unwrap();
        process::write_pid_file(&pid_file, std::process::id()).unwrap();

        manager.ensure_bridge("adopt-me", false).await.unwrap();
        assert!(manager.is_running("adopt-me").await.unwrap());

        // Adoption must not have touched the actual process; clean up the
        // PID file ourselves rather than terminating the test runner.
        let mut records = manager.records.lock().await;
        records.remove("adopt-me");
        drop(records);
        process::remove_pid_file(&pid_file);
    }

    #[tokio::test]
    async fn stop_all_removes_stale_pid_files() {
        let manager = BridgeManager::new();
        let pid_file = BridgeManager::pid_file_for("straggler").unwrap();
        process::write_pid_file(&pid_file, u32::MAX - 1).unwrap();

        manager.stop_all().await.unwrap();
        assert_eq!(process::read_pid_file(&pid_file), None);
    }
}
