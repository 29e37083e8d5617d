use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use slipscan_ocr::{extension_of, is_supported_image, ContentHash, OcrBackend, ReceiptPipeline};
use slipscan_storage::{DbPool, NewReceipt};

#[derive(Debug, PartialEq, Eq)]
pub enum IntakeOutcome {
    Stored { id: i64, valid: bool },
    /// The same image bytes were stored before under this id.
    Duplicate(i64),
}

/// Scan one image file and persist the record along with its raw OCR text.
pub async fn ingest<R: OcrBackend + 'static>(
    db: &DbPool,
    pipeline: &Arc<ReceiptPipeline<R>>,
    path: &Path,
) -> anyhow::Result<IntakeOutcome> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;

    let hash = ContentHash::of(&data).to_hex();
    if let Some(existing) = slipscan_storage::find_receipt_by_hash(db, &hash).await? {
        return Ok(IntakeOutcome::Duplicate(existing.id));
    }

    let result = pipeline.process_bytes(data, &extension_of(path)).await?;

    let image_path = result
        .attachment_path
        .as_deref()
        .and_then(|p| p.to_str())
        .or_else(|| path.to_str());
    let id = slipscan_storage::insert_receipt(
        db,
        &NewReceipt {
            record: &result.record,
            raw_ocr_text: Some(&result.raw_text),
            image_path,
            image_hash: Some(&result.hash_hex),
        },
    )
    .await?;

    if !result.validation.is_valid {
        tracing::warn!(
            id,
            file = %path.display(),
            missing = ?result.validation.missing_names(),
            "receipt needs manual review"
        );
    }

    Ok(IntakeOutcome::Stored { id, valid: result.validation.is_valid })
}

/// Queue the images already sitting in `dir` onto `tx` from a background task,
/// so the caller can start draining the channel right away.
pub fn queue_existing(dir: &Path, tx: mpsc::Sender<PathBuf>) -> std::io::Result<JoinHandle<()>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if is_supported_image(&path) {
            paths.push(path);
        }
    }
    paths.sort();
    tracing::info!(count = paths.len(), "queueing receipts already in intake folder");

    Ok(tokio::spawn(async move {
        for path in paths {
            if tx.send(path).await.is_err() {
                break;
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, GrayImage, Luma};
    use slipscan_ocr::{MockRecognizer, Normalizer, NormalizerConfig, UnavailableRecognizer};

    fn write_png(path: &Path) {
        let img = GrayImage::from_fn(8, 8, |x, _| Luma([if x == 4 { 10 } else { 240 }]));
        DynamicImage::ImageLuma8(img).save(path).unwrap();
    }

    fn fast_normalizer() -> Normalizer {
        Normalizer::new(NormalizerConfig { denoise_patch: 3, denoise_search: 5, ..Default::default() })
    }

    #[tokio::test]
    async fn ingest_stores_then_detects_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let db = slipscan_storage::create_db(&dir.path().join("r.db")).await.unwrap();
        let pipeline = Arc::new(
            ReceiptPipeline::new(MockRecognizer::new("WALMART\n02/07/2026\nTOTAL $48.65"))
                .with_normalizer(fast_normalizer())
                .with_attachments_dir(dir.path().join("attachments")),
        );
        let image = dir.path().join("receipt.png");
        write_png(&image);

        let first = ingest(&db, &pipeline, &image).await.unwrap();
        let IntakeOutcome::Stored { id, valid } = first else {
            panic!("expected a stored receipt, got {first:?}");
        };
        assert!(valid);

        let stored = slipscan_storage::get_receipt_by_id(&db, id).await.unwrap().unwrap();
        assert_eq!(stored.record.store_name.as_deref(), Some("Walmart"));
        assert_eq!(stored.raw_ocr_text.as_deref(), Some("WALMART\n02/07/2026\nTOTAL $48.65"));
        assert!(stored.image_path.unwrap().contains("attachments"));

        assert_eq!(ingest(&db, &pipeline, &image).await.unwrap(), IntakeOutcome::Duplicate(id));
    }

    #[tokio::test]
    async fn incomplete_receipt_is_stored_as_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let db = slipscan_storage::create_db(&dir.path().join("r.db")).await.unwrap();
        let pipeline = Arc::new(
            ReceiptPipeline::new(MockRecognizer::new("blurry")).with_normalizer(fast_normalizer()),
        );
        let image = dir.path().join("receipt.png");
        write_png(&image);

        let outcome = ingest(&db, &pipeline, &image).await.unwrap();
        assert!(matches!(outcome, IntakeOutcome::Stored { valid: false, .. }));
    }

    #[tokio::test]
    async fn queue_existing_handles_more_files_than_channel_capacity() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..70 {
            std::fs::write(dir.path().join(format!("r{i:02}.png")), b"png").unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), b"text").unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let queued = queue_existing(dir.path(), tx).unwrap();

        let mut received = Vec::new();
        while let Some(path) = rx.recv().await {
            received.push(path);
        }
        queued.await.unwrap();

        assert_eq!(received.len(), 70);
        assert!(received.windows(2).all(|p| p[0] < p[1]));
        assert!(received.iter().all(|p| is_supported_image(p)));
    }

    #[tokio::test]
    async fn engine_failure_is_an_error_and_stores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let db = slipscan_storage::create_db(&dir.path().join("r.db")).await.unwrap();
        let pipeline = Arc::new(ReceiptPipeline::new(UnavailableRecognizer).with_normalizer(fast_normalizer()));
        let image = dir.path().join("receipt.png");
        write_png(&image);

        assert!(ingest(&db, &pipeline, &image).await.is_err());
        assert!(slipscan_storage::get_all_receipts(&db).await.unwrap().is_empty());
    }
}
