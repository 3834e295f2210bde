//! Clawker — host-to-container service mesh for isolated AI-agent Docker
//! sandboxes. This binary exposes the hidden subprocess surface the
//! Manager/Bridge Manager invoke: `host-proxy serve|status|stop` and
//! `bridge serve`.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "clawker")]
#[command(version)]
#[command(about = "Host-to-container service mesh for isolated AI-agent Docker sandboxes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host Proxy Daemon commands.
    #[command(subcommand)]
    HostProxy(HostProxyCommands),
    /// Socket Bridge commands.
    #[command(subcommand)]
    Bridge(BridgeCommands),
}

#[derive(Subcommand)]
enum HostProxyCommands {
    /// Runs the daemon in the foreground of the current process.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Reports whether the daemon is reachable on the configured port.
    Status {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Stops the daemon named by the PID file.
    Stop {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(Subcommand)]
enum BridgeCommands {
    /// Runs one container's socket bridge in the foreground of the
    /// current process; this is what the Socket Bridge Manager spawns
    /// detached.
    Serve {
        #[arg(long)]
        container: String,
        #[arg(long = "pid-file")]
        pid_file: PathBuf,
        #[arg(long)]
        gpg: bool,
    },
}

fn init_logging() {
    let log_path = if let Ok(path) = std::env::var("CLAWKER_LOG_FILE") {
        PathBuf::from(path)
    } else if clawker::env::is_any_test() {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/clawker-test/clawker.log")
    } else {
        clawker::Config::config_dir()
            .map(|dir| dir.join("clawker.log"))
            .unwrap_or_else(|_| PathBuf::from("/tmp/clawker.log"))
    };

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    if let Ok(log_file) = std::fs::File::options().create(true).append(true).open(&log_path) {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .target(env_logger::Target::Pipe(Box::new(log_file)))
            .format_timestamp_secs()
            .init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::HostProxy(HostProxyCommands::Serve { port }) => {
            clawker::commands::host_proxy::serve(port).await?;
        }
        Commands::HostProxy(HostProxyCommands::Status { port }) => {
            clawker::commands::host_proxy::status(port).await?;
        }
        Commands::HostProxy(HostProxyCommands::Stop { port }) => {
            clawker::commands::host_proxy::stop(port)?;
        }
        Commands::Bridge(BridgeCommands::Serve {
            container,
            pid_file,
            gpg,
        }) => {
            clawker::commands::bridge::serve(container, pid_file, gpg).await?;
        }
    }

    Ok(())
}
