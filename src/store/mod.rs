//! SQLite operational store.
//!
//! Single-file database in WAL mode shared by every job. The connection sits
//! behind `Arc<Mutex<_>>` so jobs can fan work out across tokio tasks; no
//! lock is ever held across an await point.
//!
//! Tables:
//! - `users` - app users, harvest queue ordering via `last_synced_at`
//! - `machines` - fleet registry, rates and last known bin weights
//! - `submission_reviews` - imported disposal records (UNIQUE vendor id)
//! - `cleaning_records` - detected bag collections
//! - `merchant_wallets` / `wallet_transactions` / `withdrawals` - mirror money
//! - `machine_logs` - verbatim webhook payloads

pub mod cleaning;
pub mod machines;
pub mod models;
pub mod submissions;
pub mod users;
pub mod wallet;

pub use models::{
    current_timestamp, round2, CleaningRecord, Machine, NewCleaning, NewSubmission, ReviewStatus,
    SubmissionRow, TransactionType, User, Wallet, WalletTransaction, WasteType, WeightObservation,
    WithdrawalRow, EXTERNAL_SYNC_HOLDER, EXTERNAL_SYNC_MARKER,
};

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Serialization(serde_json::Error),
    Database(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "IO error: {}", e),
            StoreError::Serialization(e) => write!(f, "Serialization error: {}", e),
            StoreError::Database(e) => write!(f, "Database error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

/// Handle to the operational database. Cloning is cheap (shared connection).
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init_schema(&conn)?;

        log::info!("✅ SQLite store initialized with WAL mode");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests. Same schema, no pragmas.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                vendor_user_no TEXT,
                phone TEXT UNIQUE NOT NULL,
                nickname TEXT,
                last_synced_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_users_last_synced
                ON users(last_synced_at);

            CREATE TABLE IF NOT EXISTS machines (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_no TEXT UNIQUE NOT NULL,
                merchant_id TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                zone TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                is_manual_offline INTEGER NOT NULL DEFAULT 0,
                bin1_waste_type TEXT,
                bin2_waste_type TEXT,
                bin1_weight_kg REAL NOT NULL DEFAULT 0,
                bin2_weight_kg REAL NOT NULL DEFAULT 0,
                rate_plastic REAL NOT NULL DEFAULT 0,
                rate_can REAL NOT NULL DEFAULT 0,
                rate_paper REAL NOT NULL DEFAULT 0,
                rate_uco REAL NOT NULL DEFAULT 0,
                rate_glass REAL NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS submission_reviews (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                vendor_record_id TEXT UNIQUE NOT NULL,
                user_id TEXT,
                phone TEXT,
                device_no TEXT NOT NULL,
                waste_type TEXT NOT NULL,
                weight REAL NOT NULL,
                calculated_value REAL NOT NULL,
                machine_points REAL NOT NULL,
                status TEXT NOT NULL,
                bin_weight_snapshot REAL NOT NULL DEFAULT 0,
                photo_url TEXT,
                source TEXT NOT NULL,
                submitted_at INTEGER NOT NULL,
                reviewed_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_reviews_device_time
                ON submission_reviews(device_no, submitted_at DESC);
            CREATE INDEX IF NOT EXISTS idx_reviews_user_status
                ON submission_reviews(user_id, status);

            CREATE TABLE IF NOT EXISTS cleaning_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_no TEXT NOT NULL,
                merchant_id TEXT,
                waste_type TEXT NOT NULL,
                bag_weight_collected REAL NOT NULL,
                cleaned_at INTEGER NOT NULL,
                photo_url TEXT,
                cleaner_name TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_cleaning_device_time
                ON cleaning_records(device_no, cleaned_at DESC);

            CREATE TABLE IF NOT EXISTS merchant_wallets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                merchant_id TEXT NOT NULL,
                current_balance REAL NOT NULL DEFAULT 0,
                updated_at INTEGER,
                UNIQUE(user_id, merchant_id)
            );

            CREATE TABLE IF NOT EXISTS wallet_transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                merchant_id TEXT NOT NULL,
                amount REAL NOT NULL,
                balance_after REAL NOT NULL,
                transaction_type TEXT NOT NULL,
                description TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_txns_user_type
                ON wallet_transactions(user_id, transaction_type);

            CREATE TABLE IF NOT EXISTS withdrawals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                amount REAL NOT NULL,
                status TEXT NOT NULL,
                bank_name TEXT NOT NULL DEFAULT '',
                account_number TEXT NOT NULL DEFAULT '',
                account_holder_name TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_withdrawals_user
                ON withdrawals(user_id);

            CREATE TABLE IF NOT EXISTS machine_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_no TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                vendor_user_no TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_machine_logs_device
                ON machine_logs(device_no, created_at DESC);",
        )?;
        Ok(())
    }
}

/// "?,?,?" placeholder list for dynamic IN clauses.
pub(crate) fn repeat_vars(count: usize) -> String {
    let mut s = "?,".repeat(count);
    s.pop();
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        // Re-running the DDL must be a no-op
        let conn = store.conn.lock().unwrap();
        Store::init_schema(&conn).unwrap();
    }

    #[test]
    fn open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("fleet.db");
        let store = Store::open(&path).unwrap();
        drop(store);
        assert!(path.exists());
    }

    #[test]
    fn repeat_vars_builds_placeholder_lists() {
        assert_eq!(repeat_vars(1), "?");
        assert_eq!(repeat_vars(3), "?,?,?");
    }
}
