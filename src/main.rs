//! proxy-worker: one worker process of a TLS-terminating reverse proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!   supervisor (proxy-ctl)
//!        │ control channel: stdin pipe or Unix socket, one byte per opcode
//!        ▼
//!   ┌──────────────────────────── event loop (current_thread) ───────────────────────────┐
//!   │  ControlChannel ──▶ ShutdownCoordinator ──▶ WorkerPool (acceptors + workers)       │
//!   │                                                  ▲                                 │
//!   │  rotation / fetch timers ──▶ TicketKeyManager ───┘ push key snapshots              │
//!   │                                   │                                                │
//!   │                             memcached (optional)                                   │
//!   └────────────────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::AsyncRead;

use proxy_worker::config::loader::load_config;
use proxy_worker::config::ProxyConfig;
use proxy_worker::lifecycle::{LoopExit, WorkerProcess};
use proxy_worker::net::listener::Acceptor;
use proxy_worker::observability::logging::{init_logging, LogReopener};
use proxy_worker::observability::metrics::init_metrics;
use proxy_worker::worker::{DiscardService, WorkerError, WorkerPool};

#[derive(Parser)]
#[command(name = "proxy-worker")]
#[command(about = "Worker process: ticket keys, graceful shutdown and supervisor control", long_about = None)]
struct Cli {
    /// Configuration file (TOML). Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    let config = Arc::new(config);

    let logs = init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "proxy-worker starting");
    tracing::info!(
        bind_addresses = ?config.listener.bind_addresses,
        num_workers = config.workers.num_workers,
        tls = config.tls.enabled,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let acceptors = Acceptor::bind_all(&config.listener)?;

    let exit = match &config.control.socket {
        Some(path) => {
            let socket = tokio::net::UnixStream::connect(path).await?;
            tracing::info!(socket = %path.display(), "Control channel connected");
            run(config.clone(), socket, logs, acceptors).await?
        }
        None => run(config.clone(), tokio::io::stdin(), logs, acceptors).await?,
    };

    let code = match exit {
        LoopExit::Graceful => {
            tracing::info!("Shutdown complete");
            0
        }
        LoopExit::ControlChannelClosed => 1,
    };
    // a pending blocking stdin read would hold up runtime shutdown
    std::process::exit(code);
}

async fn run<R: AsyncRead + Unpin>(
    config: Arc<ProxyConfig>,
    control: R,
    logs: Arc<dyn LogReopener>,
    acceptors: Vec<Acceptor>,
) -> Result<LoopExit, WorkerError> {
    let workers = config.workers.clone();
    let worker_logs = logs.clone();
    WorkerProcess::new(config, control, logs)
        .run(move |keys| WorkerPool::start(acceptors, &workers, Arc::new(DiscardService), worker_logs, keys))
        .await
}
