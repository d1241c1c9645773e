use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dedup_core::{DataSetUpload, Datum};
use dedup_engine::{
    backfill_hashes, BackfillOptions, DeduplicatorRegistry, EngineConfig, FinalizeService,
    SharedSession,
};
use dedup_store::{DeadlineSession, JsonFileStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dedup-cli")]
#[command(about = "Device data deduplication command-line interface")]
struct Cli {
    /// JSON document store to operate on; created on first write.
    #[arg(long, global = true, default_value = "dedup-store.json")]
    store: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Open an upload, add its datums in batches, then finalize it.
    Ingest {
        /// Upload record (JSON object, camelCase fields).
        #[arg(long)]
        upload: PathBuf,
        /// Datums (JSON array of objects).
        #[arg(long)]
        data: PathBuf,
        #[arg(long, default_value_t = 500)]
        batch_size: usize,
    },
    /// Finalize an upload that is already stored.
    Finalize {
        #[arg(long)]
        upload_id: String,
    },
    /// Write content fingerprints onto stored datums that lack one.
    BackfillHashes {
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the effective engine configuration.
    ShowConfig,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = EngineConfig::from_env()?;

    if let Commands::ShowConfig = cli.command {
        let registry = DeduplicatorRegistry::from_config(&config)?;
        println!("{}", serde_json::to_string_pretty(&config)?);
        println!("registry order: {}", registry.factory_names().join(" -> "));
        return Ok(());
    }

    let store = Arc::new(JsonFileStore::open(cli.store.clone()).await?);
    let session: SharedSession = Arc::new(DeadlineSession::new(
        Arc::clone(&store),
        config.store_timeout(),
    ));
    let registry = Arc::new(DeduplicatorRegistry::from_config(&config)?);
    let service = FinalizeService::new(registry, Arc::clone(&session));

    // Whatever the store accepted before a failure is kept, as a database would keep it.
    let outcome = run(cli.command, &service, &session).await;
    store.persist().await?;
    let summary = outcome?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn run(
    command: Commands,
    service: &FinalizeService,
    session: &SharedSession,
) -> Result<serde_json::Value> {
    match command {
        Commands::Ingest {
            upload,
            data,
            batch_size,
        } => {
            let upload: DataSetUpload = read_json(&upload)?;
            let datums: Vec<Datum> = read_json(&data)?;
            let upload_id = upload.upload_id.clone();
            info!(upload_id = %upload_id, datums = datums.len(), batch_size, "ingesting upload");
            let report = service
                .ingest(upload, datums, batch_size)
                .await
                .with_context(|| format!("ingesting upload {upload_id}"))?;
            Ok(serde_json::to_value(report)?)
        }
        Commands::Finalize { upload_id } => {
            let report = service
                .finalize_upload(&upload_id)
                .await
                .with_context(|| format!("finalizing upload {upload_id}"))?;
            Ok(serde_json::to_value(report)?)
        }
        Commands::BackfillHashes { dry_run } => {
            let report = backfill_hashes(
                session.as_ref(),
                BackfillOptions {
                    dry_run,
                    ..BackfillOptions::default()
                },
            )
            .await
            .context("backfilling fingerprints")?;
            Ok(serde_json::to_value(report)?)
        }
        Commands::ShowConfig => Ok(serde_json::to_value(service.registry().factory_names())?),
    }
}
