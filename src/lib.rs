// Library modules
pub mod bridge;
pub mod commands;
pub mod config;
pub mod constants;
pub mod docker;
pub mod env;
pub mod error;
pub mod process;
pub mod proxy;
pub mod session;

// Re-export commonly used types
pub use config::Config;
pub use error::{ClawkerError, Result};
