use serde::{Deserialize, Serialize};

use crate::receipt::{ReceiptField, ReceiptRecord};

/// Fields a record must carry to be considered usable, in reporting order.
pub const REQUIRED_FIELDS: [ReceiptField; 3] =
    [ReceiptField::StoreName, ReceiptField::Date, ReceiptField::Total];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub missing_fields: Vec<ReceiptField>,
}

impl ValidationResult {
    /// Check field presence only; a present total of `0.00` still counts.
    pub fn of(record: &ReceiptRecord) -> Self {
        let missing_fields: Vec<ReceiptField> = REQUIRED_FIELDS
            .into_iter()
            .filter(|f| !record.is_present(*f))
            .collect();
        Self { is_valid: missing_fields.is_empty(), missing_fields }
    }

    pub fn missing_names(&self) -> Vec<&'static str> {
        self.missing_fields.iter().map(|f| f.as_str()).collect()
    }
}
