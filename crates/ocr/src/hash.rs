use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

/// SHA-256 of a receipt image's original bytes; identifies the image for
/// duplicate detection and names its stored copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn of(data: &[u8]) -> Self {
        ContentHash(Sha256::digest(data).into())
    }

    /// Lowercase hex, 64 chars.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Layout: `<dir>/<first 2 hex chars>/<full hex>.<ext>`
    pub fn attachment_path(&self, dir: &Path, ext: &str) -> PathBuf {
        let hex = self.to_hex();
        dir.join(&hex[..2]).join(format!("{hex}.{ext}"))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
