use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Tuning for the image normalizer. Defaults are tuned for thermal-paper
/// receipts photographed with a phone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Filter strength `h` for non-local means.
    pub denoise_strength: f32,
    /// Side of the square patch compared by non-local means (odd).
    pub denoise_patch: u32,
    /// Side of the square search window for non-local means (odd).
    pub denoise_search: u32,
    /// CLAHE tile grid is `clahe_tiles × clahe_tiles`.
    pub clahe_tiles: u32,
    pub clahe_clip_limit: f32,
    /// Side of the neighborhood used by the adaptive threshold (odd, ≥ 3).
    pub threshold_block: u32,
    /// Subtracted from the local mean before comparing.
    pub threshold_bias: i16,
    /// Radius of the closing structuring element; 0 is a single pixel.
    pub close_radius: u8,
    /// When set, larger photos are downscaled so neither side exceeds this.
    /// Unset keeps output dimensions equal to the input's.
    pub max_dimension: Option<u32>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            denoise_strength: 10.0,
            denoise_patch: 7,
            denoise_search: 21,
            clahe_tiles: 8,
            clahe_clip_limit: 2.0,
            threshold_block: 11,
            threshold_bias: 2,
            close_radius: 0,
            max_dimension: None,
        }
    }
}

impl NormalizerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let odd = |name: &str, v: u32, min: u32| {
            if v < min || v % 2 == 0 {
                Err(ConfigError::Invalid(format!("{name} must be odd and >= {min}, got {v}")))
            } else {
                Ok(())
            }
        };
        odd("denoise_patch", self.denoise_patch, 1)?;
        odd("denoise_search", self.denoise_search, 1)?;
        odd("threshold_block", self.threshold_block, 3)?;
        if self.clahe_tiles == 0 {
            return Err(ConfigError::Invalid("clahe_tiles must be positive".into()));
        }
        if self.denoise_strength <= 0.0 || self.clahe_clip_limit <= 0.0 {
            return Err(ConfigError::Invalid(
                "denoise_strength and clahe_clip_limit must be positive".into(),
            ));
        }
        if self.max_dimension == Some(0) {
            return Err(ConfigError::Invalid("max_dimension must be positive".into()));
        }
        Ok(())
    }
}

/// Tesseract page segmentation assumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageSegmentation {
    Auto,
    SingleColumn,
    /// A single uniform block of text. Receipts are narrow single-column prints.
    SingleBlock,
    SparseText,
}

impl PageSegmentation {
    pub fn code(self) -> u8 {
        match self {
            PageSegmentation::Auto => 3,
            PageSegmentation::SingleColumn => 4,
            PageSegmentation::SingleBlock => 6,
            PageSegmentation::SparseText => 11,
        }
    }
}

/// Immutable OCR engine settings, handed to a recognizer at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub language: String,
    /// Directory holding `*.traineddata`; `None` uses the system default.
    pub data_path: Option<PathBuf>,
    pub page_segmentation: PageSegmentation,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            language: "eng".to_string(),
            data_path: None,
            page_segmentation: PageSegmentation::SingleBlock,
        }
    }
}

impl EngineConfig {
    /// Tesseract's default engine selection, the one leptess initializes with:
    /// whatever the language data supports, LSTM on any modern install.
    pub const ENGINE_MODE: u8 = 3;

    /// The equivalent `tesseract` command-line flags.
    pub fn as_args(&self) -> String {
        format!(
            "--oem {} --psm {}",
            Self::ENGINE_MODE,
            self.page_segmentation.code()
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub normalizer: NormalizerConfig,
    pub engine: EngineConfig,
    /// Extra vendor templates, in TOML, appended to the built-in registry.
    pub templates: Option<PathBuf>,
}

impl PipelineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.normalizer.validate()?;
        Ok(config)
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml_str(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}
