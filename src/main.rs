use clap::Parser;
use sql_extractor::{
    Config, EventPublisher, LogPublisher, ObjectStoreStorage, Result, Runner, WebhookPublisher,
    cancel_on_signal,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "sql-extractor",
    version,
    about = "Run SQL extracts through a remote agent and ship them to object storage"
)]
struct Cli {
    /// Path to the YAML configuration file
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, kind = ?e.kind(), "extract failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::from_file(&cli.config)?;

    let jobs = config.read_jobs()?;
    if jobs.is_empty() {
        info!("no queries found");
        return Ok(());
    }
    info!(count = jobs.len(), "found queries");

    let webhook = WebhookPublisher::from_config(&config.events);
    let flush_timeout = config.events.webhook_timeout;
    let publisher: Arc<dyn EventPublisher> = match &webhook {
        Some(webhook) => Arc::new(webhook.clone()),
        None => Arc::new(LogPublisher),
    };

    let storage = config
        .storage
        .as_ref()
        .map(ObjectStoreStorage::from_config)
        .transpose()?;

    let mut runner = Runner::new(config, publisher);
    if let Some(storage) = storage {
        runner = runner.with_storage(Arc::new(storage));
    }

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let result = runner.run(&cancel).await;
    cancel.cancel();

    if let Some(webhook) = webhook {
        webhook.flush(flush_timeout).await;
    }
    result
}
