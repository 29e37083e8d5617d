use thiserror::Error;

use crate::config::EngineConfig;

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("OCR engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("Image decode error: {0}")]
    ImageDecode(String),
    #[error("OCR engine error: {0}")]
    Engine(String),
}

/// Abstraction over an OCR backend.
///
/// Implementations accept encoded image bytes (PNG/JPEG) and return the
/// recognized text, newline-delimited, top to bottom as printed. No
/// interpretation of the text happens here.
pub trait OcrBackend: Send + Sync {
    fn recognize(&self, image_bytes: &[u8]) -> Result<String, OcrError>;
}

impl<T: OcrBackend + ?Sized> OcrBackend for Box<T> {
    fn recognize(&self, image_bytes: &[u8]) -> Result<String, OcrError> {
        (**self).recognize(image_bytes)
    }
}

// ── Mock backend (always available, used for tests) ───────────────────────────

/// Returns a pre-set string, so the pipeline can be exercised without an
/// engine installed.
pub struct MockRecognizer {
    pub text: String,
}

impl MockRecognizer {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

impl OcrBackend for MockRecognizer {
    fn recognize(&self, _image_bytes: &[u8]) -> Result<String, OcrError> {
        Ok(self.text.clone())
    }
}

/// Stand-in used when the crate is built without an engine backend.
pub struct UnavailableRecognizer;

impl OcrBackend for UnavailableRecognizer {
    fn recognize(&self, _image_bytes: &[u8]) -> Result<String, OcrError> {
        Err(OcrError::EngineUnavailable(
            "built without an OCR engine; enable the `tesseract` feature".into(),
        ))
    }
}

/// The best backend this build supports for `config`.
pub fn default_backend(config: &EngineConfig) -> Box<dyn OcrBackend> {
    #[cfg(feature = "tesseract")]
    {
        Box::new(tesseract_backend::TesseractRecognizer::new(config.clone()))
    }
    #[cfg(not(feature = "tesseract"))]
    {
        tracing::warn!(args = %config.as_args(), "no OCR engine compiled in");
        Box::new(UnavailableRecognizer)
    }
}

// ── Tesseract backend (optional, gated behind `tesseract` feature) ─────────────

#[cfg(feature = "tesseract")]
pub mod tesseract_backend {
    use super::{OcrBackend, OcrError};
    use crate::config::EngineConfig;
    use leptess::{LepTess, Variable};
    use tracing::debug;

    /// Runs Tesseract through leptess. A fresh engine handle is created per
    /// call, so independent images may be recognized in parallel.
    pub struct TesseractRecognizer {
        config: EngineConfig,
    }

    impl TesseractRecognizer {
        pub fn new(config: EngineConfig) -> Self {
            Self { config }
        }
    }

    impl OcrBackend for TesseractRecognizer {
        fn recognize(&self, image_bytes: &[u8]) -> Result<String, OcrError> {
            let data_path = self.config.data_path.as_deref().and_then(|p| p.to_str());
            let mut lt = LepTess::new(data_path, &self.config.language)
                .map_err(|e| OcrError::EngineUnavailable(e.to_string()))?;
            let psm = self.config.page_segmentation.code().to_string();
            lt.set_variable(Variable::TesseditPagesegMode, &psm)
                .map_err(|e| OcrError::Engine(e.to_string()))?;
            debug!(args = %self.config.as_args(), lang = %self.config.language, "running tesseract");
            lt.set_image_from_mem(image_bytes)
                .map_err(|e| OcrError::ImageDecode(e.to_string()))?;
            lt.get_utf8_text().map_err(|e| OcrError::Engine(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_returns_preset_text() {
        let r = MockRecognizer::new("WALMART\nTOTAL $5.50");
        assert_eq!(r.recognize(b"fake image data").unwrap(), "WALMART\nTOTAL $5.50");
        assert_eq!(r.recognize(b"").unwrap(), "WALMART\nTOTAL $5.50");
    }

    #[test]
    fn boxed_backend_delegates() {
        let r: Box<dyn OcrBackend> = Box::new(MockRecognizer::new("hello"));
        assert_eq!(r.recognize(b"anything").unwrap(), "hello");
    }

    #[test]
    fn unavailable_backend_reports_engine_unavailable() {
        let err = UnavailableRecognizer.recognize(b"png").unwrap_err();
        assert!(matches!(err, OcrError::EngineUnavailable(_)));
    }

    #[cfg(not(feature = "tesseract"))]
    #[test]
    fn default_backend_without_engine_is_unavailable() {
        let backend = default_backend(&EngineConfig::default());
        assert!(matches!(
            backend.recognize(b"png"),
            Err(OcrError::EngineUnavailable(_))
        ));
    }
}
