use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use slipscan_core::{ReceiptRecord, ValidationResult};

use crate::config::{ConfigError, PipelineConfig};
use crate::hash::ContentHash;
use crate::parser::ReceiptParser;
use crate::preprocess::{encode_as_png, NormalizeError, Normalizer};
use crate::recognizer::{OcrBackend, OcrError};
use crate::rules::{TemplateError, TemplateRegistry};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image normalization failed: {0}")]
    Normalize(#[from] NormalizeError),
    #[error("OCR recognition failed: {0}")]
    Ocr(#[from] OcrError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Vendor template error: {0}")]
    Template(#[from] TemplateError),
    #[error("Scan task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Everything one image produced.
#[derive(Debug, Clone)]
pub struct ScanResult {
    /// SHA-256 hex digest of the original bytes.
    pub hash_hex: String,
    /// Where the original was stored, when an attachment directory is set.
    pub attachment_path: Option<PathBuf>,
    /// Raw OCR text, kept verbatim for audit.
    pub raw_text: String,
    pub record: ReceiptRecord,
    pub validation: ValidationResult,
    /// Name of the vendor template used, if a vendor was recognized.
    pub template: Option<String>,
}

/// Runs normalize → recognize → parse → validate for one image at a time.
///
/// Holds no per-image state, so a shared pipeline can serve independent
/// images concurrently as long as the backend allows it.
pub struct ReceiptPipeline<R: OcrBackend> {
    normalizer: Normalizer,
    recognizer: R,
    parser: ReceiptParser,
    attachments_dir: Option<PathBuf>,
}

impl<R: OcrBackend> ReceiptPipeline<R> {
    pub fn new(recognizer: R) -> Self {
        Self {
            normalizer: Normalizer::default(),
            recognizer,
            parser: ReceiptParser::default(),
            attachments_dir: None,
        }
    }

    /// Normalizer settings and vendor templates come from `config`; the
    /// recognizer is expected to have been built from `config.engine`.
    pub fn from_config(recognizer: R, config: &PipelineConfig) -> Result<Self, PipelineError> {
        config.normalizer.validate()?;
        let registry = match &config.templates {
            Some(path) => TemplateRegistry::load(path)?,
            None => TemplateRegistry::builtin(),
        };
        Ok(Self::new(recognizer)
            .with_normalizer(Normalizer::new(config.normalizer.clone()))
            .with_parser(ReceiptParser::new(registry)))
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_parser(mut self, parser: ReceiptParser) -> Self {
        self.parser = parser;
        self
    }

    /// Store originals under `dir` in a content-addressed layout.
    pub fn with_attachments_dir(mut self, dir: PathBuf) -> Self {
        self.attachments_dir = Some(dir);
        self
    }

    /// The normalized image as PNG, for display or debugging.
    pub fn normalized_preview(&self, data: &[u8]) -> Result<Vec<u8>, PipelineError> {
        Ok(self.normalizer.prepare_for_ocr_from_bytes(data)?)
    }

    /// Run the full pipeline over in-memory image bytes. Blocks for the
    /// duration of recognition.
    pub fn scan(&self, data: &[u8]) -> Result<ScanResult, PipelineError> {
        let hash = ContentHash::of(data);

        let normalized = self.normalizer.normalize_bytes(data)?;
        debug!(hash = %hash, width = normalized.width(), height = normalized.height(), "normalized");

        let raw_text = self.recognizer.recognize(&encode_as_png(normalized)?)?;
        debug!(hash = %hash, chars = raw_text.len(), "recognized");

        let parsed = self.parser.parse_detailed(&raw_text);
        let validation = ValidationResult::of(&parsed.record);

        Ok(ScanResult {
            hash_hex: hash.to_hex(),
            attachment_path: None,
            raw_text,
            record: parsed.record,
            validation,
            template: parsed.template,
        })
    }

    /// Keep a copy of the original under the attachment directory, if one is
    /// configured. Storing the same bytes twice writes the same path.
    pub async fn store_attachment(
        &self,
        data: &[u8],
        ext: &str,
    ) -> Result<Option<PathBuf>, PipelineError> {
        let Some(dir) = &self.attachments_dir else {
            return Ok(None);
        };
        let dest = ContentHash::of(data).attachment_path(dir, ext);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&dest, data).await?;
        Ok(Some(dest))
    }
}

impl<R: OcrBackend + 'static> ReceiptPipeline<R> {
    /// Scan raw bytes on the blocking thread pool and, if configured, keep a
    /// copy of the original.
    pub async fn process_bytes(self: &Arc<Self>, data: Vec<u8>, ext: &str) -> Result<ScanResult, PipelineError> {
        let pipeline = Arc::clone(self);
        let (data, result) = tokio::task::spawn_blocking(move || {
            let result = pipeline.scan(&data);
            (data, result)
        })
        .await?;
        let mut result = result?;
        result.attachment_path = self.store_attachment(&data, ext).await?;
        info!(
            hash = %result.hash_hex,
            valid = result.validation.is_valid,
            template = ?result.template,
            "receipt scanned"
        );
        Ok(result)
    }

    /// Process a file on disk.
    pub async fn process_file(self: &Arc<Self>, path: &Path) -> Result<ScanResult, PipelineError> {
        let bytes = tokio::fs::read(path).await?;
        self.process_bytes(bytes, &extension_of(path)).await
    }
}

/// Lowercased file extension, `bin` when there is none.
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("bin")
        .to_lowercase()
}

/// Whether `path` names a raster format the normalizer can decode.
pub fn is_supported_image(path: &Path) -> bool {
    matches!(
        extension_of(path).as_str(),
        "jpg" | "jpeg" | "png" | "webp" | "bmp" | "tif" | "tiff"
    )
}

// ── Watch-folder integration ──────────────────────────────────────────────────

/// Spawn a notify watcher on `watch_dir` that sends newly created image paths
/// to `tx`. The watcher must be kept alive for watching to continue.
pub fn spawn_intake_watcher(
    watch_dir: &Path,
    tx: mpsc::Sender<PathBuf>,
) -> notify::Result<impl notify::Watcher> {
    use notify::{RecursiveMode, Watcher};

    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| match event {
        Ok(ev) => forward_created_images(ev, &tx),
        Err(e) => warn!("intake watcher error: {e}"),
    })?;

    watcher.watch(watch_dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// Send the supported images of a create event. Runs on the watcher thread and
/// blocks while the channel is full.
fn forward_created_images(event: notify::Event, tx: &mpsc::Sender<PathBuf>) {
    if !matches!(event.kind, notify::EventKind::Create(_)) {
        return;
    }
    for path in event.paths.into_iter().filter(|p| is_supported_image(p)) {
        if let Err(e) = tx.blocking_send(path) {
            warn!("intake channel closed, dropping {}", e.0.display());
            return;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NormalizerConfig;
    use crate::recognizer::{MockRecognizer, UnavailableRecognizer};
    use image::{DynamicImage, GrayImage, ImageBuffer, Luma};
    use notify::event::{CreateKind, ModifyKind};
    use notify::{Event, EventKind};
    use rust_decimal::Decimal;
    use slipscan_core::ReceiptField;
    use std::io::Cursor;
    use std::sync::Mutex;
    use std::thread::{self, ThreadId};

    fn tiny_png() -> Vec<u8> {
        let img: GrayImage = ImageBuffer::from_fn(8, 8, |x, _| Luma([if x == 3 { 20 } else { 230 }]));
        let mut buf = Vec::new();
        DynamicImage::ImageLuma8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    fn fast_normalizer() -> Normalizer {
        Normalizer::new(NormalizerConfig { denoise_patch: 3, denoise_search: 5, ..Default::default() })
    }

    fn pipeline(text: &str) -> ReceiptPipeline<MockRecognizer> {
        ReceiptPipeline::new(MockRecognizer::new(text)).with_normalizer(fast_normalizer())
    }

    #[test]
    fn scan_produces_record_and_validation() {
        let result = pipeline("WALMART\n02/07/2026\nSUBTOTAL $45.00\nTOTAL $48.65")
            .scan(&tiny_png())
            .unwrap();
        assert_eq!(result.hash_hex.len(), 64);
        assert_eq!(result.template.as_deref(), Some("Walmart"));
        assert_eq!(result.record.total, Some(Decimal::new(4865, 2)));
        assert!(result.validation.is_valid);
        assert!(result.attachment_path.is_none());
    }

    #[test]
    fn scan_keeps_raw_text_verbatim() {
        let text = "line one\n  line two  \n";
        let result = pipeline(text).scan(&tiny_png()).unwrap();
        assert_eq!(result.raw_text, text);
        assert_eq!(
            result.validation.missing_fields,
            vec![ReceiptField::StoreName, ReceiptField::Date, ReceiptField::Total]
        );
    }

    #[test]
    fn invalid_image_propagates() {
        let err = pipeline("WALMART").scan(b"not an image").unwrap_err();
        assert!(matches!(err, PipelineError::Normalize(NormalizeError::InvalidImage(_))));
    }

    #[test]
    fn missing_engine_propagates() {
        let p = ReceiptPipeline::new(UnavailableRecognizer).with_normalizer(fast_normalizer());
        let err = p.scan(&tiny_png()).unwrap_err();
        assert!(matches!(err, PipelineError::Ocr(OcrError::EngineUnavailable(_))));
    }

    #[test]
    fn preview_is_png() {
        let png = pipeline("").normalized_preview(&tiny_png()).unwrap();
        assert_eq!(&png[..4], b"\x89PNG");
    }

    #[test]
    fn supported_image_extensions() {
        assert!(is_supported_image(Path::new("/in/receipt.JPG")));
        assert!(is_supported_image(Path::new("scan.png")));
        assert!(!is_supported_image(Path::new("notes.txt")));
        assert!(!is_supported_image(Path::new("README")));
    }

    #[test]
    fn from_config_loads_templates() {
        let dir = tempfile::tempdir().unwrap();
        let templates = dir.path().join("templates.toml");
        std::fs::write(&templates, "[[template]]\nname = \"Deli\"\nkeywords = [\"deli\"]\n").unwrap();
        let config = PipelineConfig {
            normalizer: NormalizerConfig { denoise_patch: 3, denoise_search: 5, ..Default::default() },
            templates: Some(templates),
            ..Default::default()
        };
        let p = ReceiptPipeline::from_config(MockRecognizer::new("THE DELI\nTOTAL 3.00"), &config)
            .unwrap();
        let result = p.scan(&tiny_png()).unwrap();
        assert_eq!(result.record.store_name.as_deref(), Some("Deli"));
    }

    #[test]
    fn from_config_reports_missing_template_file() {
        let config = PipelineConfig {
            templates: Some(PathBuf::from("/nonexistent/templates.toml")),
            ..Default::default()
        };
        let err = ReceiptPipeline::from_config(MockRecognizer::new(""), &config).err().unwrap();
        assert!(matches!(err, PipelineError::Template(TemplateError::Io(_))));
    }

    #[tokio::test]
    async fn process_bytes_stores_attachment() {
        let dir = tempfile::tempdir().unwrap();
        let p = Arc::new(pipeline("WALMART").with_attachments_dir(dir.path().to_path_buf()));
        let data = tiny_png();

        let r1 = p.process_bytes(data.clone(), "png").await.unwrap();
        let r2 = p.process_bytes(data.clone(), "png").await.unwrap();

        let stored = r1.attachment_path.clone().unwrap();
        assert!(stored.exists());
        assert_eq!(std::fs::read(&stored).unwrap(), data);
        assert_eq!(r1.hash_hex, r2.hash_hex);
        assert_eq!(r1.attachment_path, r2.attachment_path);
    }

    #[tokio::test]
    async fn store_attachment_without_dir_is_noop() {
        let stored = pipeline("").store_attachment(b"bytes", "png").await.unwrap();
        assert!(stored.is_none());
    }

    #[tokio::test]
    async fn process_file_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("receipt.png");
        std::fs::write(&path, tiny_png()).unwrap();
        let result = Arc::new(pipeline("walmart\nTOTAL 2.50")).process_file(&path).await.unwrap();
        assert_eq!(result.record.total, Some(Decimal::new(250, 2)));
    }

    /// Records the thread recognition ran on.
    #[derive(Default)]
    struct ThreadRecorder(Mutex<Option<ThreadId>>);

    impl OcrBackend for ThreadRecorder {
        fn recognize(&self, _image_bytes: &[u8]) -> Result<String, OcrError> {
            *self.0.lock().unwrap() = Some(thread::current().id());
            Ok("TOTAL 1.00".into())
        }
    }

    #[tokio::test]
    async fn process_bytes_scans_off_the_async_thread() {
        let p = Arc::new(ReceiptPipeline::new(ThreadRecorder::default()).with_normalizer(fast_normalizer()));
        let result = p.process_bytes(tiny_png(), "png").await.unwrap();
        assert_eq!(result.record.total, Some(Decimal::new(100, 2)));

        let scanned_on = p.recognizer.0.lock().unwrap().unwrap();
        assert_ne!(scanned_on, thread::current().id());
    }

    #[tokio::test]
    async fn process_bytes_reports_engine_failure() {
        let p = Arc::new(ReceiptPipeline::new(UnavailableRecognizer).with_normalizer(fast_normalizer()));
        let err = p.process_bytes(tiny_png(), "png").await.unwrap_err();
        assert!(matches!(err, PipelineError::Ocr(OcrError::EngineUnavailable(_))));
    }

    #[test]
    fn watcher_waits_for_room_instead_of_dropping() {
        let (tx, mut rx) = mpsc::channel(1);
        let event = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/in/a.png"))
            .add_path(PathBuf::from("/in/notes.txt"))
            .add_path(PathBuf::from("/in/b.jpg"))
            .add_path(PathBuf::from("/in/c.png"));

        let sender = thread::spawn(move || forward_created_images(event, &tx));
        let mut received = Vec::new();
        while let Some(path) = rx.blocking_recv() {
            received.push(path);
        }
        sender.join().unwrap();

        assert_eq!(
            received,
            [PathBuf::from("/in/a.png"), PathBuf::from("/in/b.jpg"), PathBuf::from("/in/c.png")]
        );
    }

    #[test]
    fn watcher_ignores_non_create_events() {
        let (tx, mut rx) = mpsc::channel(4);
        forward_created_images(
            Event::new(EventKind::Modify(ModifyKind::Any)).add_path(PathBuf::from("a.png")),
            &tx,
        );
        drop(tx);
        assert!(rx.blocking_recv().is_none());
    }
}
