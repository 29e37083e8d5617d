use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use slipscan_ocr::{default_backend, PipelineConfig, ReceiptPipeline};

mod intake;

use intake::IntakeOutcome;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let project_dirs = directories::ProjectDirs::from("com", "slipscan", "Slipscan")
        .context("Failed to resolve the application data directory")?;
    let data_dir = project_dirs.data_dir().to_path_buf();

    let attachments_dir = data_dir.join("attachments");
    let intake_dir = data_dir.join("intake");
    std::fs::create_dir_all(&attachments_dir).context("Failed to create attachments directory")?;
    std::fs::create_dir_all(&intake_dir).context("Failed to create intake directory")?;

    let db = slipscan_storage::create_db(&data_dir.join("receipts.db"))
        .await
        .context("Failed to open receipt database")?;

    let config = PipelineConfig::load(&data_dir.join("slipscan.toml"))?;
    tracing::info!(engine = %config.engine.as_args(), lang = %config.engine.language, "OCR configured");

    let pipeline = Arc::new(
        ReceiptPipeline::from_config(default_backend(&config.engine), &config)?
            .with_attachments_dir(attachments_dir),
    );

    // ── Receipt intake ────────────────────────────────────────────────────────
    // The channel bridges the notify watcher thread and the async processor.
    let (receipt_tx, mut receipt_rx) = mpsc::channel::<PathBuf>(64);

    // The watcher must be kept alive for the duration of the app.
    let _watcher = slipscan_ocr::spawn_intake_watcher(&intake_dir, receipt_tx.clone())
        .context("Failed to start intake folder watcher")?;

    // Files dropped in while the app was not running.
    let _backlog = intake::queue_existing(&intake_dir, receipt_tx)
        .context("Failed to read intake directory")?;

    tracing::info!("Watching intake folder: {}", intake_dir.display());

    loop {
        tokio::select! {
            Some(path) = receipt_rx.recv() => {
                tracing::info!("Processing receipt: {}", path.display());
                match intake::ingest(&db, &pipeline, &path).await {
                    Ok(IntakeOutcome::Stored { id, valid }) => {
                        tracing::info!(id, valid, "Receipt stored: {}", path.display());
                    }
                    Ok(IntakeOutcome::Duplicate(id)) => {
                        tracing::info!(id, "Already stored, skipping: {}", path.display());
                    }
                    Err(e) => {
                        tracing::warn!("Receipt pipeline error for {}: {e:#}", path.display());
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}
