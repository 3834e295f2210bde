//! Host Proxy: the HTTP control-plane daemon containers talk to.

mod daemon;
mod handlers;
mod listeners;
mod manager;
mod router;
mod server;

pub use daemon::Daemon;
pub use manager::Manager;
pub use router::AppState;
pub use server::Server;
