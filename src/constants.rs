//! Application-wide constants.
//!
//! Centralizes the timeout, TTL, and polling numbers the component design
//! calls out as defaults so they are defined exactly once.

use std::time::Duration;

/// Service identifier returned by `GET /health`, checked by the Manager's
/// health probe to avoid hijacking by an unrelated loopback server.
pub const SERVICE_IDENTIFIER: &str = "clawker-host-proxy";

/// Default host proxy HTTP port.
pub const DEFAULT_PORT: u16 = 18374;

// ---------------------------------------------------------------------
// HTTP router
// ---------------------------------------------------------------------

/// Read timeout for an inbound HTTP request.
pub const HTTP_READ_TIMEOUT: Duration = Duration::from_secs(10);
/// Write timeout for an outbound HTTP response.
pub const HTTP_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Idle keep-alive timeout.
pub const HTTP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Maximum request/response body size accepted by the router.
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

// ---------------------------------------------------------------------
// Callback sessions
// ---------------------------------------------------------------------

/// Default callback session TTL.
pub const DEFAULT_CALLBACK_TTL: Duration = Duration::from_secs(5 * 60);
/// Maximum callback session TTL a caller may request.
pub const MAX_CALLBACK_TTL: Duration = Duration::from_secs(30 * 60);
/// Default path a callback listener matches if the caller leaves it empty.
pub const DEFAULT_CALLBACK_PATH: &str = "/callback";
/// Maximum captured request body size.
pub const MAX_CALLBACK_BODY: usize = 64 * 1024;

// ---------------------------------------------------------------------
// Session store
// ---------------------------------------------------------------------

/// Interval between background eviction sweeps of the session store.
pub const EVICTION_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Grace period given to a dynamic listener's shutdown before it is forced.
pub const LISTENER_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------
// Population watcher
// ---------------------------------------------------------------------

/// Default grace period before the population watcher starts polling.
pub const DEFAULT_WATCHER_GRACE_PERIOD: Duration = Duration::from_secs(60);
/// Default interval between population watcher polls.
pub const DEFAULT_WATCHER_POLL_INTERVAL: Duration = Duration::from_secs(30);
/// Default consecutive-error threshold before the watcher gives up and
/// shuts the daemon down.
pub const DEFAULT_MAX_CONSECUTIVE_ERRS: u32 = 10;

// ---------------------------------------------------------------------
// Manager / daemon lifecycle
// ---------------------------------------------------------------------

/// Budget for the Manager to observe the daemon become healthy after spawn.
pub const MANAGER_START_HEALTHY_BUDGET: Duration = Duration::from_secs(3);
/// Poll interval while waiting for the daemon to become healthy.
pub const MANAGER_HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Timeout for a single health-check HTTP request.
pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
/// Budget given to the Server for a graceful shutdown.
pub const SERVER_SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);
/// Timeout waiting for a bridge's PID file to appear after spawn.
pub const BRIDGE_PID_FILE_WAIT: Duration = Duration::from_secs(5);

/// `User-Agent` header sent with outbound health-check requests.
pub fn user_agent() -> String {
    format!("clawker/{}", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_values_are_reasonable() {
        assert!(HTTP_READ_TIMEOUT >= Duration::from_secs(5));
        assert!(HTTP_READ_TIMEOUT <= Duration::from_secs(60));
        assert!(DEFAULT_CALLBACK_TTL < MAX_CALLBACK_TTL);
    }

    #[test]
    fn test_max_body_size_is_one_mebibyte() {
        assert_eq!(MAX_BODY_SIZE, 1_048_576);
    }
}
