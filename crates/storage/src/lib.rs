pub mod db;

pub use db::{
    create_db, delete_receipt, find_receipt_by_hash, get_all_receipts, get_receipt_by_id,
    get_spending_summary, insert_receipt, update_receipt, DbPool, NewReceipt, StoreSpending,
    StoredReceipt,
};
