//! autobuild-term - detached PTY host daemon.

use std::path::PathBuf;
use std::sync::Arc;

use autobuild_term::{default_socket_path, TermDaemon};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "autobuild-term", about = "Auto-Build terminal daemon")]
struct Args {
    /// Socket path to listen on. Defaults to the per-user runtime path.
    #[arg(long)]
    socket: Option<PathBuf>,
}

fn main() {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let socket_path = args.socket.unwrap_or_else(default_socket_path);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async {
        let daemon = Arc::new(TermDaemon::new(socket_path));
        let shutdown = daemon.shutdown_token();

        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received SIGINT");
                shutdown.cancel();
            }
        });

        if let Err(e) = daemon.run().await {
            error!("terminal daemon error: {}", e);
            std::process::exit(1);
        }
    });
}
