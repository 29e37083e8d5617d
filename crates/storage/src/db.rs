use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use slipscan_core::{Money, ReceiptRecord};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

pub type DbPool = Pool<Sqlite>;

pub async fn create_db(path: &Path) -> Result<DbPool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;

    run_migrations(&pool).await?;
    tracing::debug!(path = %path.display(), "receipt database ready");

    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    // Amounts are TEXT decimals so stored values round-trip exactly.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS receipts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            store_name TEXT,
            date TEXT,
            subtotal TEXT,
            tax TEXT,
            total TEXT,
            transaction_id TEXT,
            image_path TEXT,
            image_hash TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            raw_ocr_text TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_receipts_image_hash ON receipts(image_hash)")
        .execute(pool)
        .await?;

    Ok(())
}

/// A parsed receipt together with the artifacts kept for audit.
#[derive(Debug, Clone)]
pub struct NewReceipt<'a> {
    pub record: &'a ReceiptRecord,
    pub raw_ocr_text: Option<&'a str>,
    pub image_path: Option<&'a str>,
    pub image_hash: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredReceipt {
    pub id: i64,
    pub record: ReceiptRecord,
    pub image_path: Option<String>,
    pub image_hash: Option<String>,
    pub created_at: String,
    pub raw_ocr_text: Option<String>,
}

/// Per-store aggregate; receipts without a recognized store share one row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreSpending {
    pub store_name: Option<String>,
    pub receipt_count: u32,
    pub total_spent: Money,
    pub total_tax: Money,
    /// Mean over receipts that carry a total.
    pub average_spent: Money,
}

type ReceiptRow = (
    i64,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
);

const SELECT_RECEIPT: &str = "SELECT id, store_name, date, subtotal, tax, total, transaction_id, \
     image_path, image_hash, created_at, raw_ocr_text FROM receipts";

fn amount_to_text(amount: Option<Decimal>) -> Option<String> {
    amount.map(|d| d.to_string())
}

fn text_to_amount(text: Option<String>) -> Option<Decimal> {
    text.and_then(|s| Decimal::from_str(&s).ok())
}

fn row_to_receipt(r: ReceiptRow) -> StoredReceipt {
    StoredReceipt {
        id: r.0,
        record: ReceiptRecord {
            store_name: r.1,
            date: r.2,
            subtotal: text_to_amount(r.3),
            tax: text_to_amount(r.4),
            total: text_to_amount(r.5),
            transaction_id: r.6,
        },
        image_path: r.7,
        image_hash: r.8,
        created_at: r.9,
        raw_ocr_text: r.10,
    }
}

pub async fn insert_receipt(pool: &DbPool, receipt: &NewReceipt<'_>) -> Result<i64, sqlx::Error> {
    let r = receipt.record;
    let result = sqlx::query(
        "INSERT INTO receipts (store_name, date, subtotal, tax, total, transaction_id, \
         image_path, image_hash, raw_ocr_text) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(r.store_name.as_deref())
    .bind(r.date.as_deref())
    .bind(amount_to_text(r.subtotal))
    .bind(amount_to_text(r.tax))
    .bind(amount_to_text(r.total))
    .bind(r.transaction_id.as_deref())
    .bind(receipt.image_path)
    .bind(receipt.image_hash)
    .bind(receipt.raw_ocr_text)
    .execute(pool)
    .await?;

    let id = result.last_insert_rowid();
    tracing::debug!(id, "receipt stored");
    Ok(id)
}

pub async fn get_receipt_by_id(pool: &DbPool, id: i64) -> Result<Option<StoredReceipt>, sqlx::Error> {
    let row = sqlx::query_as::<_, ReceiptRow>(&format!("{SELECT_RECEIPT} WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(row_to_receipt))
}

/// All receipts, most recent receipt date first. Receipts whose date does not
/// parse come last; ties go to the most recently stored.
pub async fn get_all_receipts(pool: &DbPool) -> Result<Vec<StoredReceipt>, sqlx::Error> {
    let rows = sqlx::query_as::<_, ReceiptRow>(SELECT_RECEIPT)
        .fetch_all(pool)
        .await?;
    let mut receipts: Vec<(Option<NaiveDate>, StoredReceipt)> = rows
        .into_iter()
        .map(row_to_receipt)
        .map(|r| (r.record.parsed_date(), r))
        .collect();
    receipts.sort_by(|(da, a), (db, b)| db.cmp(da).then_with(|| b.id.cmp(&a.id)));
    Ok(receipts.into_iter().map(|(_, r)| r).collect())
}

/// A previously stored receipt for the same image bytes, if any.
pub async fn find_receipt_by_hash(
    pool: &DbPool,
    image_hash: &str,
) -> Result<Option<StoredReceipt>, sqlx::Error> {
    let row = sqlx::query_as::<_, ReceiptRow>(&format!(
        "{SELECT_RECEIPT} WHERE image_hash = ? ORDER BY id LIMIT 1"
    ))
    .bind(image_hash)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(row_to_receipt))
}

/// Replace the structured fields of a receipt (e.g. after manual correction).
/// Returns `false` when no receipt has this id.
pub async fn update_receipt(
    pool: &DbPool,
    id: i64,
    record: &ReceiptRecord,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE receipts SET store_name = ?, date = ?, subtotal = ?, tax = ?, total = ?, \
         transaction_id = ? WHERE id = ?",
    )
    .bind(record.store_name.as_deref())
    .bind(record.date.as_deref())
    .bind(amount_to_text(record.subtotal))
    .bind(amount_to_text(record.tax))
    .bind(amount_to_text(record.total))
    .bind(record.transaction_id.as_deref())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete_receipt(pool: &DbPool, id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM receipts WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Spending per store, highest total first.
pub async fn get_spending_summary(pool: &DbPool) -> Result<Vec<StoreSpending>, sqlx::Error> {
    let rows = sqlx::query_as::<_, (Option<String>, Option<String>, Option<String>)>(
        "SELECT store_name, total, tax FROM receipts ORDER BY id",
    )
    .fetch_all(pool)
    .await?;

    struct Acc {
        count: u32,
        with_total: u32,
        total: Decimal,
        tax: Decimal,
    }

    // A garbled OCR amount can sit near `Decimal::MAX`; it is left out of the
    // sums instead of overflowing them.
    let add = |sum: &mut Decimal, amount: Decimal, store: &Option<String>| -> bool {
        match sum.checked_add(amount) {
            Some(s) => {
                *sum = s;
                true
            }
            None => {
                tracing::warn!(store = ?store, %amount, "amount overflows spending summary, skipped");
                false
            }
        }
    };

    let mut by_store: HashMap<Option<String>, Acc> = HashMap::new();
    for (store, total, tax) in rows {
        let total = text_to_amount(total);
        let tax = text_to_amount(tax);
        let acc = by_store.entry(store.clone()).or_insert(Acc {
            count: 0,
            with_total: 0,
            total: Decimal::ZERO,
            tax: Decimal::ZERO,
        });
        acc.count += 1;
        if let Some(t) = total {
            if add(&mut acc.total, t, &store) {
                acc.with_total += 1;
            }
        }
        if let Some(t) = tax {
            add(&mut acc.tax, t, &store);
        }
    }

    let mut summary: Vec<StoreSpending> = by_store
        .into_iter()
        .map(|(store_name, acc)| {
            let total_spent = Money::from_decimal(acc.total);
            StoreSpending {
                store_name,
                receipt_count: acc.count,
                total_spent,
                total_tax: Money::from_decimal(acc.tax),
                average_spent: Money::from_decimal(acc.total) / acc.with_total,
            }
        })
        .collect();
    summary.sort_by(|a, b| {
        b.total_spent
            .cmp(&a.total_spent)
            .then_with(|| a.store_name.cmp(&b.store_name))
    });
    Ok(summary)
}
