use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use blobsync_core::BlobServiceClient;
use blobsyncd::{BlobStore, BlobSync, PendingOperation, SyncConfig, logging};
use tracing::{info, warn};

const STATUS_LIMIT: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Status,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--status" => mode = CliMode::Status,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    logging::init();
    match parse_cli_mode(std::env::args())? {
        CliMode::Help => {
            println!("Usage: blobsyncd [--status]");
            println!("  (default)  Upload and delete everything queued, then exit");
            println!("  --status   List pending and failed operations and exit");
            Ok(())
        }
        CliMode::Status => {
            let config = SyncConfig::from_env()?;
            let store = open_store(&config).await?;
            print_status(&store).await
        }
        CliMode::Run => {
            let config = SyncConfig::from_env()?;
            flush(config).await
        }
    }
}

async fn open_store(config: &SyncConfig) -> anyhow::Result<BlobStore> {
    let store = BlobStore::open(&config.db_path, config.collections.clone())
        .await
        .with_context(|| format!("opening {}", config.db_path.display()))?;
    store.ensure_schema().await.context("creating collections")?;
    Ok(store)
}

async fn print_status(store: &BlobStore) -> anyhow::Result<()> {
    let pending = store.first_pending(STATUS_LIMIT).await?;
    println!("pending: {}", pending.len());
    for op in &pending {
        let progress = match &op.operation {
            PendingOperation::Upload(upload) if upload.resume_state.is_some() => "in progress",
            PendingOperation::Upload(_) => "not started",
            PendingOperation::Delete(_) => "queued",
        };
        print!(
            "  {} {} ({progress}, attempts {})",
            op.operation.kind().as_str(),
            op.path(),
            op.attempt
        );
        match &op.last_error {
            Some(error) => println!(": {error}"),
            None => println!(),
        }
    }
    let failed = store.list_failed().await?;
    println!("failed: {}", failed.len());
    for op in &failed {
        println!(
            "  {} {} after {} attempts: {}",
            op.operation.kind().as_str(),
            op.operation.path(),
            op.attempt,
            op.error
        );
    }
    Ok(())
}

async fn flush(config: SyncConfig) -> anyhow::Result<()> {
    let api_url = config
        .api_url
        .as_deref()
        .context("BLOBSYNC_API_URL is not set")?;
    let api_token = config
        .api_token
        .clone()
        .context("BLOBSYNC_API_TOKEN is not set")?;
    let client = BlobServiceClient::new(api_url, api_token).context("building API client")?;
    let store = open_store(&config).await?;

    let halted = Arc::new(AtomicBool::new(false));
    let halted_flag = Arc::clone(&halted);
    let sync = BlobSync::builder(Arc::new(client))
        .retry(config.retry)
        .on_complete(|event| info!(path = %event.path, kind = event.kind.as_str(), "synced"))
        .on_error(move |event| {
            if !event.dead_lettered {
                halted_flag.store(true, Ordering::SeqCst);
            }
        })
        .bind(store);

    tokio::select! {
        _ = sync.wait_idle() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for ctrl-c")?;
            warn!("interrupted, unfinished uploads resume on next run");
            return Ok(());
        }
    }

    let remaining = sync.pending(STATUS_LIMIT).await?;
    if halted.load(Ordering::SeqCst) && !remaining.is_empty() {
        anyhow::bail!(
            "queue halted at {} with {} operation(s) left",
            remaining[0].path(),
            remaining.len()
        );
    }
    let failed = sync.failed().await?.len();
    info!(failed, "queue flushed");
    Ok(())
}
