pub mod money;
pub mod receipt;
pub mod validation;

pub use money::Money;
pub use receipt::{ReceiptField, ReceiptRecord};
pub use validation::{ValidationResult, REQUIRED_FIELDS};
