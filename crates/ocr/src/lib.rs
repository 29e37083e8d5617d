pub mod config;
pub mod filters;
pub mod hash;
pub mod parser;
pub mod pipeline;
pub mod preprocess;
pub mod recognizer;
pub mod rules;

pub use config::{ConfigError, EngineConfig, NormalizerConfig, PageSegmentation, PipelineConfig};
pub use hash::ContentHash;
pub use parser::{parse, validate, ParsedReceipt, ReceiptParser};
pub use pipeline::{extension_of, is_supported_image, spawn_intake_watcher, PipelineError, ReceiptPipeline, ScanResult};
pub use preprocess::{NormalizeError, Normalizer};
pub use recognizer::{default_backend, MockRecognizer, OcrBackend, OcrError, UnavailableRecognizer};
pub use rules::{FieldRules, Rule, TemplateError, TemplateRegistry, VendorTemplate};
pub use slipscan_core::{ReceiptField, ReceiptRecord, ValidationResult};
