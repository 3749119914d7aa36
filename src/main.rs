// src/main.rs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use odm_batch::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(
    name = "odm-batch",
    about = "Resumable batch downloads backed by SQLite",
    version
)]
struct Cli {
    /// SQLite database holding batch and file records
    #[arg(long, global = true, env = "ODM_DATABASE", default_value = "downloads.db")]
    database: PathBuf,

    /// Directory new batches are saved under
    #[arg(long, global = true, env = "ODM_STORAGE_ROOT", default_value = "downloads")]
    storage_root: PathBuf,

    /// JSON config file; missing fields take their defaults
    #[arg(long, global = true, env = "ODM_CONFIG")]
    config: Option<PathBuf>,

    /// Root used for files persisted to external storage
    #[arg(long, global = true)]
    external_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a batch of URLs, resuming it if it is already stored
    Download {
        batch_id: String,
        title: String,
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Resume every stored batch that has not finished
    ResumeStored,
    /// Print the status of every stored batch
    Status,
    /// Delete a stored batch and its files
    Delete { batch_id: String },
}

/// Prints each batch status the engine publishes.
struct ConsoleSink;

impl DownloadSessionSink for ConsoleSink {
    fn on_batch_status(&self, status: &DownloadBatchStatus) {
        println!("{}", status_line(status));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "odm_batch=info".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let manager = build_manager(&cli).await?;
    manager.initialise(Arc::new(ConsoleSink));

    match cli.command {
        Commands::Download {
            batch_id,
            title,
            urls,
        } => {
            let mut builder = Batch::builder(&cli.storage_root, DownloadBatchId::new(batch_id), title);
            for url in urls {
                builder = builder.download_from(url).apply();
            }
            let batch = builder.build().context("invalid batch")?;
            manager.download(&batch).await?;
            run_until_settled(&manager).await
        }
        Commands::ResumeStored => {
            manager
                .submit_all_stored_downloads(|| info!("stored downloads dispatched"))
                .await?;
            for status in manager.get_all_download_batch_statuses().await? {
                if matches!(status.status, Status::Paused | Status::Error) {
                    manager.resume(&status.batch_id).await?;
                }
            }
            run_until_settled(&manager).await
        }
        Commands::Status => {
            manager.restore_stored_downloads().await?;
            let statuses = manager.get_all_download_batch_statuses().await?;
            if statuses.is_empty() {
                println!("no stored batches");
            }
            for status in &statuses {
                println!("{}", status_line(status));
            }
            Ok(())
        }
        Commands::Delete { batch_id } => {
            let batch_id = DownloadBatchId::new(batch_id);
            manager.restore_stored_downloads().await?;
            if manager.get_download_status_with_matching(&batch_id).await.is_none() {
                bail!("no stored batch with id {batch_id}");
            }
            manager.delete(&batch_id).await?;
            info!(%batch_id, "batch deleted");
            Ok(())
        }
    }
}

async fn build_manager(cli: &Cli) -> Result<DownloadManager> {
    let config = match &cli.config {
        Some(path) => DownloadManagerConfig::from_json_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => DownloadManagerConfig::default(),
    }
    .with_env_overrides();

    let persistence = SqliteDownloadsPersistence::open(&cli.database)
        .await
        .with_context(|| format!("opening database {}", cli.database.display()))?;

    let mut builder = DownloadManager::builder(Arc::new(persistence)).with_config(config);
    if let Some(root) = &cli.external_root {
        builder = builder.with_external_root(root);
    }
    let manager = builder.build()?;
    info!(
        database = %cli.database.display(),
        max_concurrent_downloads = manager.config().max_concurrent_downloads,
        allowed_connection_type = ?manager.config().allowed_connection_type,
        "starting download manager"
    );
    Ok(manager)
}

/// Polls until no batch is queued or transferring. Ctrl-C pauses everything
/// so progress is kept for the next run.
async fn run_until_settled(manager: &DownloadManager) -> Result<()> {
    let settled = async {
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            let statuses = manager.get_all_download_batch_statuses().await?;
            if statuses.iter().all(|status| is_settled(status.status)) {
                return Ok::<_, ManagerError>(statuses);
            }
        }
    };

    let statuses = tokio::select! {
        statuses = settled => statuses?,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, pausing active batches");
            for status in manager.get_all_download_batch_statuses().await? {
                manager.pause(&status.batch_id).await?;
            }
            return Ok(());
        }
    };

    let failed: Vec<_> = statuses
        .iter()
        .filter(|status| status.status == Status::Error)
        .collect();
    if !failed.is_empty() {
        bail!("{} batch(es) failed", failed.len());
    }
    Ok(())
}

fn is_settled(status: Status) -> bool {
    !matches!(
        status,
        Status::Queued | Status::Downloading | Status::Deletion
    )
}

fn status_line(status: &DownloadBatchStatus) -> String {
    let total = status
        .bytes_total_size
        .map_or_else(|| "?".to_string(), |total| total.to_string());
    let mut line = format!(
        "{} [{}] {} {}% ({}/{} bytes)",
        status.batch_id,
        status.title,
        status.status.as_str(),
        status.percentage_downloaded,
        status.bytes_downloaded,
        total
    );
    if let Some(failure) = &status.download_error {
        line.push_str(&format!(": {:?} {}", failure.error_type, failure.message));
    }
    line
}
