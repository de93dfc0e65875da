//! autobuildd - Auto-Build orchestrator daemon entry point.

use std::path::PathBuf;

use autobuildd::{Daemon, DaemonConfig};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "autobuildd", about = "Auto-Build orchestrator daemon")]
struct Args {
    /// Per-user data directory.
    #[arg(long, env = "AUTOBUILD_DATA_DIR")]
    data_dir: Option<PathBuf>,
    /// Port for the request surface.
    #[arg(long, default_value_t = 7710)]
    port: u16,
    /// Terminal daemon socket path.
    #[arg(long)]
    term_socket: Option<PathBuf>,
}

fn main() {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = DaemonConfig::default();
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    config.port = args.port;
    if let Some(socket) = args.term_socket {
        config.term_socket = socket;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async {
        let daemon = match Daemon::new(config) {
            Ok(daemon) => daemon,
            Err(e) => {
                error!("failed to initialize daemon: {}", e);
                std::process::exit(1);
            }
        };
        tokio::select! {
            result = daemon.run() => {
                if let Err(e) = result {
                    error!("daemon error: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT; shutting down");
            }
        }
    });
}
