use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, error::ErrorKind};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use hostagent::cli::{Cli, LogFormat};
use hostagent::core::{HostAgent, Instance, JsonLinesReporter};
use hostagent::{Error, Result, load_vm_config};

const LOG_ENV: &str = "HOSTAGENT_LOG";

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(64),
            };
        }
    };

    init_logging(cli.log_format);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to start the async runtime");
            return ExitCode::from(71);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "hostagent failed");
            err.exit_code()
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let instance = Instance::open(&cli.instance, cli.home.as_deref())?;
    let config = load_vm_config(&instance.config_path())?;
    for warning in &config.warnings {
        warn!(config = %config.file_path.display(), "{warning}");
    }

    let (interrupt_tx, interrupt_rx) = mpsc::channel(1);
    forward_signals(interrupt_tx)?;

    info!(instance = %instance.name(), dir = %instance.dir().display(), "starting host agent");
    let reporter = Arc::new(JsonLinesReporter::new(io::stdout()));
    HostAgent::new(instance, config, reporter, interrupt_rx)
        .run(CancellationToken::new())
        .await
}

/// Turns SIGINT and SIGTERM into shutdown requests.
fn forward_signals(tx: mpsc::Sender<()>) -> Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())
        .map_err(|err| Error::io("failed to listen for SIGINT", err))?;
    let mut terminate = signal(SignalKind::terminate())
        .map_err(|err| Error::io("failed to listen for SIGTERM", err))?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(()) = interrupt.recv() => info!("received SIGINT"),
                Some(()) = terminate.recv() => info!("received SIGTERM"),
                else => break,
            }
            if let Err(TrySendError::Closed(())) = tx.try_send(()) {
                break;
            }
        }
    });
    Ok(())
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("debug"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(fmt::layer().pretty().with_writer(io::stderr))
            .init(),
    }
}
