//! CLI command wiring for the hidden subprocess surface: `host-proxy
//! serve|status|stop` and `bridge serve`. Each command is invoked both
//! interactively (for debugging) and as a subprocess spawned by the
//! corresponding Manager.

pub mod bridge;
pub mod host_proxy;
