//! proxy-ctl: run a proxy-worker and forward supervisor signals to it.
//!
//! SIGQUIT asks the worker for a graceful shutdown, SIGUSR1 to reopen its
//! logs. SIGINT/SIGTERM close the control channel, which the worker takes as
//! an order to stop immediately. proxy-ctl exits with the worker's status.

use std::path::PathBuf;
use std::process::Stdio;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use proxy_worker::ipc::send_opcode;
use proxy_worker::lifecycle::signals::{SignalTranslator, SupervisorAction};

#[derive(Parser)]
#[command(name = "proxy-ctl")]
#[command(about = "Supervise a proxy-worker over its control channel", long_about = None)]
struct Cli {
    /// Worker binary to run.
    #[arg(long, default_value = "proxy-worker")]
    worker: PathBuf,

    /// Arguments passed through to the worker.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "proxy_ctl=info,proxy_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut signals = SignalTranslator::install()?;

    // own process group: a terminal ^C reaches only the supervisor
    let mut child = tokio::process::Command::new(&cli.worker)
        .args(&cli.args)
        .stdin(Stdio::piped())
        .process_group(0)
        .spawn()?;
    let mut control = Some(child.stdin.take().ok_or("worker stdin is not piped")?);
    tracing::info!(worker = %cli.worker.display(), pid = ?child.id(), "Worker started");

    let status = loop {
        tokio::select! {
            status = child.wait() => break status?,
            action = signals.next() => match action {
                SupervisorAction::Send(opcode) => {
                    let Some(writer) = control.as_mut() else {
                        tracing::warn!(opcode = opcode.name(), "Control channel already closed");
                        continue;
                    };
                    match send_opcode(writer, opcode).await {
                        Ok(()) => tracing::info!(opcode = opcode.name(), "Sent control opcode"),
                        Err(e) => tracing::warn!(opcode = opcode.name(), error = %e, "Failed to send control opcode"),
                    }
                }
                SupervisorAction::CloseChannel => {
                    if control.take().is_some() {
                        tracing::info!("Closed control channel; worker shuts down immediately");
                    }
                }
            },
        }
    };

    tracing::info!(status = %status, "Worker exited");
    std::process::exit(status.code().unwrap_or(1));
}
