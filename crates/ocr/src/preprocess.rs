use image::{DynamicImage, GrayImage};
use std::io::Cursor;
use std::path::Path;
use std::time::Instant;
use thiserror::Error;
use tracing::debug;

use crate::config::NormalizerConfig;
use crate::filters;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("Invalid image: {0}")]
    InvalidImage(String),
    #[error("Failed to encode processed image: {0}")]
    Encode(String),
}

impl From<image::ImageError> for NormalizeError {
    fn from(e: image::ImageError) -> Self {
        NormalizeError::InvalidImage(e.to_string())
    }
}

/// Turns a receipt photo into a black/white raster suited to OCR.
///
/// Steps, in order: grayscale → non-local means denoise → CLAHE → adaptive
/// Gaussian threshold → morphological close. Each step expects the previous
/// one's output; the thresholding in particular relies on denoised,
/// contrast-normalized input.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    config: NormalizerConfig,
}

impl Normalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Normalize a decoded image. Output has the same dimensions as the input
    /// unless `max_dimension` forces a downscale.
    pub fn normalize(&self, img: &DynamicImage) -> Result<GrayImage, NormalizeError> {
        if img.width() == 0 || img.height() == 0 {
            return Err(NormalizeError::InvalidImage("image has no pixels".into()));
        }
        let cfg = &self.config;
        let started = Instant::now();

        let gray = match cfg.max_dimension {
            Some(max) if img.width() > max || img.height() > max => img
                .resize(max, max, image::imageops::FilterType::Lanczos3)
                .to_luma8(),
            _ => img.to_luma8(),
        };
        let (w, h) = gray.dimensions();

        let denoised = filters::non_local_means(
            &gray,
            cfg.denoise_strength,
            cfg.denoise_patch,
            cfg.denoise_search,
        );
        debug!(width = w, height = h, elapsed_ms = started.elapsed().as_millis() as u64, "denoised");

        let contrast = filters::clahe(&denoised, cfg.clahe_tiles, cfg.clahe_clip_limit);
        let binary = filters::adaptive_threshold(&contrast, cfg.threshold_block, cfg.threshold_bias);
        let closed = filters::close(&binary, cfg.close_radius);

        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "image normalized");
        Ok(closed)
    }

    /// Decode raw image bytes (JPEG / PNG / WEBP / …) and normalize them.
    pub fn normalize_bytes(&self, data: &[u8]) -> Result<GrayImage, NormalizeError> {
        if data.is_empty() {
            return Err(NormalizeError::InvalidImage("empty input".into()));
        }
        let img = image::load_from_memory(data)?;
        self.normalize(&img)
    }

    /// Normalize raw image bytes and return PNG bytes ready for OCR.
    pub fn prepare_for_ocr_from_bytes(&self, data: &[u8]) -> Result<Vec<u8>, NormalizeError> {
        encode_as_png(self.normalize_bytes(data)?)
    }

    /// Load an image file, normalize it, and return PNG bytes ready for OCR.
    pub fn prepare_for_ocr(&self, path: &Path) -> Result<Vec<u8>, NormalizeError> {
        let img = image::open(path)?;
        encode_as_png(self.normalize(&img)?)
    }
}

pub fn encode_as_png(img: GrayImage) -> Result<Vec<u8>, NormalizeError> {
    let mut buf = Vec::new();
    DynamicImage::ImageLuma8(img)
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| NormalizeError::Encode(e.to_string()))?;
    Ok(buf)
}
