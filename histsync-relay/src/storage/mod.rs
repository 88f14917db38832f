//! SQLite storage backend for the relay.
//!
//! The submodules are thin data-access functions over a borrowed
//! [`Connection`], so callers decide the transaction boundaries: a
//! `rusqlite::Transaction` derefs to `Connection` and can be passed anywhere a
//! connection is expected.

pub mod deletion_requests;
pub mod devices;
pub mod dump_requests;
pub mod entries;
pub mod feedback;
pub mod models;
pub mod usage;

use crate::error::RelayError;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Thread-safe relay storage.
#[derive(Clone)]
pub struct RelayStorage {
    conn: Arc<Mutex<Connection>>,
}

impl RelayStorage {
    pub fn open(path: &Path) -> Result<Self, anyhow::Error> {
        let conn = Connection::open(path)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))?;
        conn.busy_timeout(Duration::from_secs(5))?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    #[allow(dead_code)]
    pub fn in_memory() -> Result<Self, anyhow::Error> {
        let conn = Connection::open_in_memory()?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    fn initialize_schema(&self) -> Result<(), anyhow::Error> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS devices (
                user_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                registration_ip TEXT NOT NULL,
                registration_date INTEGER NOT NULL,
                is_integration_test_device INTEGER NOT NULL DEFAULT 0,
                uninstall_date INTEGER,
                PRIMARY KEY (user_id, device_id)
            );

            CREATE TABLE IF NOT EXISTS enc_history_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                encrypted_id TEXT NOT NULL DEFAULT '',
                encrypted_data BLOB NOT NULL,
                nonce BLOB NOT NULL,
                date INTEGER NOT NULL,
                read_count INTEGER NOT NULL DEFAULT 0,
                is_from_same_device INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS dump_requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                requesting_device_id TEXT NOT NULL,
                request_time INTEGER NOT NULL,
                read_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS deletion_requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                destination_device_id TEXT NOT NULL,
                send_time INTEGER NOT NULL,
                read_count INTEGER NOT NULL DEFAULT 0,
                messages TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS usage_data (
                user_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                last_used INTEGER NOT NULL,
                last_ip TEXT NOT NULL DEFAULT '',
                num_entries_handled INTEGER NOT NULL DEFAULT 0,
                last_queried INTEGER,
                num_queries INTEGER NOT NULL DEFAULT 0,
                version TEXT NOT NULL DEFAULT '',
                PRIMARY KEY (user_id, device_id)
            );

            CREATE TABLE IF NOT EXISTS feedbacks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                date INTEGER NOT NULL,
                feedback TEXT NOT NULL DEFAULT ''
            );

            CREATE INDEX IF NOT EXISTS idx_entries_user_device
                ON enc_history_entries(user_id, device_id);
            CREATE INDEX IF NOT EXISTS idx_entries_device
                ON enc_history_entries(device_id);
            CREATE INDEX IF NOT EXISTS idx_entries_encrypted_id
                ON enc_history_entries(encrypted_id);
            CREATE INDEX IF NOT EXISTS idx_entries_read_count
                ON enc_history_entries(read_count);
            CREATE INDEX IF NOT EXISTS idx_entries_user_date
                ON enc_history_entries(user_id, date);
            CREATE INDEX IF NOT EXISTS idx_dump_requests_user
                ON dump_requests(user_id);
            CREATE INDEX IF NOT EXISTS idx_deletion_requests_user_device
                ON deletion_requests(user_id, destination_device_id);",
        )?;
        Ok(())
    }

    pub fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, RelayError> {
        self.conn
            .lock()
            .map_err(|e| RelayError::Internal(format!("Lock error: {}", e)))
    }

    pub fn ping(&self) -> Result<(), RelayError> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}

/// Timestamps are stored as nanoseconds since the epoch so that deletion
/// matching on an entry's end time is exact.
pub(crate) fn to_db_time(t: &DateTime<Utc>) -> Result<i64, RelayError> {
    t.timestamp_nanos_opt()
        .ok_or_else(|| RelayError::BadRequest(format!("Timestamp out of range: {}", t)))
}

pub(crate) fn from_db_time(nanos: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(nanos)
}
