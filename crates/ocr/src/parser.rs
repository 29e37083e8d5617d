use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::debug;

use slipscan_core::{ReceiptRecord, ValidationResult};

use crate::rules::{first_match, Rule, TemplateRegistry};

/// A parsed record plus the vendor template that was applied, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReceipt {
    pub record: ReceiptRecord,
    pub template: Option<String>,
}

/// Reads structured fields out of raw OCR text.
///
/// Parsing never fails: a field whose rules all miss is left `None`, and text
/// with nothing recognizable yields an empty record.
#[derive(Debug, Clone, Default)]
pub struct ReceiptParser {
    registry: TemplateRegistry,
}

impl ReceiptParser {
    pub fn new(registry: TemplateRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &TemplateRegistry {
        &self.registry
    }

    pub fn parse(&self, text: &str) -> ReceiptRecord {
        self.parse_detailed(text).record
    }

    pub fn parse_detailed(&self, text: &str) -> ParsedReceipt {
        let (template, rules) = self.registry.select(text);

        let record = ReceiptRecord {
            store_name: template.map(|t| t.name.clone()),
            date: field("date", &rules.date, text, to_text),
            subtotal: field("subtotal", &rules.subtotal, text, parse_amount),
            tax: field("tax", &rules.tax, text, parse_amount),
            total: field("total", &rules.total, text, parse_amount),
            transaction_id: field("transaction_id", &rules.transaction_id, text, to_text),
        };

        let template = template.map(|t| t.name.clone());
        debug!(template = ?template, missing = ?record.absent_fields(), "receipt parsed");
        ParsedReceipt { record, template }
    }
}

fn field<T>(
    name: &str,
    rules: &[Rule],
    text: &str,
    convert: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let (index, value) = first_match(rules, text, convert)?;
    debug!(field = name, rule = index, "field matched");
    Some(value)
}

fn to_text(s: &str) -> Option<String> {
    Some(s.to_string())
}

/// Digits with at most one decimal point; a trailing point ("45.") is allowed.
fn parse_amount(s: &str) -> Option<Decimal> {
    let s = s.strip_suffix('.').unwrap_or(s);
    if s.is_empty() || !s.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    Decimal::from_str(s).ok()
}

fn default_parser() -> &'static ReceiptParser {
    static P: OnceLock<ReceiptParser> = OnceLock::new();
    P.get_or_init(ReceiptParser::default)
}

/// Parse with the built-in vendor templates.
pub fn parse(text: &str) -> ReceiptRecord {
    default_parser().parse(text)
}

/// Report which required fields (store name, date, total) are absent.
pub fn validate(record: &ReceiptRecord) -> ValidationResult {
    ValidationResult::of(record)
}
