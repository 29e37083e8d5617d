use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The named fields of a [`ReceiptRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptField {
    StoreName,
    Date,
    Subtotal,
    Tax,
    Total,
    TransactionId,
}

impl ReceiptField {
    pub const ALL: [ReceiptField; 6] = [
        ReceiptField::StoreName,
        ReceiptField::Date,
        ReceiptField::Subtotal,
        ReceiptField::Tax,
        ReceiptField::Total,
        ReceiptField::TransactionId,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ReceiptField::StoreName => "store_name",
            ReceiptField::Date => "date",
            ReceiptField::Subtotal => "subtotal",
            ReceiptField::Tax => "tax",
            ReceiptField::Total => "total",
            ReceiptField::TransactionId => "transaction_id",
        }
    }
}

impl fmt::Display for ReceiptField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReceiptField {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReceiptField::ALL
            .into_iter()
            .find(|field| field.as_str() == s)
            .ok_or_else(|| format!("Unknown receipt field: '{s}'"))
    }
}

/// Best-effort structured extraction of a single receipt.
///
/// Every field is independently optional. `None` means no rule matched; it is
/// never replaced by a zero or an empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptRecord {
    pub store_name: Option<String>,
    /// Raw date text exactly as it appeared in the OCR output.
    pub date: Option<String>,
    pub subtotal: Option<Decimal>,
    pub tax: Option<Decimal>,
    pub total: Option<Decimal>,
    pub transaction_id: Option<String>,
}

impl ReceiptRecord {
    pub fn is_present(&self, field: ReceiptField) -> bool {
        match field {
            ReceiptField::StoreName => self.store_name.is_some(),
            ReceiptField::Date => self.date.is_some(),
            ReceiptField::Subtotal => self.subtotal.is_some(),
            ReceiptField::Tax => self.tax.is_some(),
            ReceiptField::Total => self.total.is_some(),
            ReceiptField::TransactionId => self.transaction_id.is_some(),
        }
    }

    /// Fields that were not extracted, in declaration order.
    pub fn absent_fields(&self) -> Vec<ReceiptField> {
        ReceiptField::ALL
            .into_iter()
            .filter(|f| !self.is_present(*f))
            .collect()
    }

    /// Interpret the raw date as a calendar date (US month/day order).
    ///
    /// Two-digit years are placed in the 2000s. Returns `None` when the raw
    /// text is absent or does not name a real day.
    pub fn parsed_date(&self) -> Option<NaiveDate> {
        parse_us_date(self.date.as_deref()?)
    }
}

fn parse_us_date(raw: &str) -> Option<NaiveDate> {
    let mut parts = raw.trim().split(['/', '-']);
    let month: u32 = parts.next()?.parse().ok()?;
    let day: u32 = parts.next()?.parse().ok()?;
    let year_str = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let year: i32 = match year_str.len() {
        2 => 2000 + year_str.parse::<i32>().ok()?,
        4 => year_str.parse().ok()?,
        _ => return None,
    };
    NaiveDate::from_ymd_opt(year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn record_with_date(date: &str) -> ReceiptRecord {
        ReceiptRecord { date: Some(date.to_string()), ..Default::default() }
    }

    #[test]
    fn default_record_has_every_field_absent() {
        let r = ReceiptRecord::default();
        assert_eq!(r.absent_fields(), ReceiptField::ALL.to_vec());
    }

    #[test]
    fn zero_total_is_present() {
        let r = ReceiptRecord { total: Some(Decimal::ZERO), ..Default::default() };
        assert!(r.is_present(ReceiptField::Total));
    }

    #[test]
    fn field_name_roundtrip() {
        for field in ReceiptField::ALL {
            assert_eq!(ReceiptField::from_str(field.as_str()).unwrap(), field);
        }
        assert!(ReceiptField::from_str("vendor").is_err());
    }

    #[test]
    fn parsed_date_four_digit_year() {
        assert_eq!(
            record_with_date("02/07/2026").parsed_date(),
            NaiveDate::from_ymd_opt(2026, 2, 7)
        );
        assert_eq!(
            record_with_date("12-31-2025").parsed_date(),
            NaiveDate::from_ymd_opt(2025, 12, 31)
        );
    }

    #[test]
    fn parsed_date_two_digit_year() {
        assert_eq!(
            record_with_date("2/7/26").parsed_date(),
            NaiveDate::from_ymd_opt(2026, 2, 7)
        );
    }

    #[test]
    fn parsed_date_rejects_impossible_day() {
        assert_eq!(record_with_date("13/45/2026").parsed_date(), None);
        assert_eq!(record_with_date("1/2/026").parsed_date(), None);
        assert_eq!(ReceiptRecord::default().parsed_date(), None);
    }

    #[test]
    fn absent_fields_serialize_as_null() {
        let json = serde_json::to_value(ReceiptRecord::default()).unwrap();
        assert!(json["total"].is_null());
        assert!(json["store_name"].is_null());
    }
}
