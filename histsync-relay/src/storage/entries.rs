//! Entry store: one row per (entry, destination device).

use super::models::{EncHistoryEntry, MessageIdentifier};
use super::{from_db_time, to_db_time};
use crate::error::RelayError;
use chrono::{DateTime, Utc};
use rusqlite::types::ToSql;
use rusqlite::{params, Connection, Row};

const COLUMNS_PER_ROW: usize = 7;

const ENTRY_COLUMNS: &str = "encrypted_data, nonce, device_id, user_id, date,
                             encrypted_id, read_count, is_from_same_device";

/// A row about to be inserted, borrowing the submitted entry.
struct PendingRow<'a> {
    entry: &'a EncHistoryEntry,
    device_id: &'a str,
    date: i64,
    is_from_same_device: bool,
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<EncHistoryEntry> {
    Ok(EncHistoryEntry {
        encrypted_data: row.get(0)?,
        nonce: row.get(1)?,
        device_id: row.get(2)?,
        user_id: row.get(3)?,
        date: from_db_time(row.get(4)?),
        encrypted_id: row.get(5)?,
        read_count: row.get(6)?,
        is_from_same_device: row.get(7)?,
    })
}

fn insert_sql(rows: usize) -> String {
    let placeholders = vec!["(?, ?, ?, ?, ?, ?, 0, ?)"; rows].join(", ");
    format!(
        "INSERT INTO enc_history_entries
            (user_id, device_id, encrypted_id, encrypted_data, nonce, date,
             read_count, is_from_same_device)
         VALUES {}",
        placeholders
    )
}

/// Insert rows with multi-row statements of at most `chunk_size` rows.
///
/// Chunking only bounds the bind-parameter count per statement; atomicity is
/// whatever transaction `conn` belongs to.
fn insert_rows(conn: &Connection, rows: &[PendingRow<'_>], chunk_size: usize) -> Result<usize, RelayError> {
    let mut inserted = 0;
    for chunk in rows.chunks(chunk_size.max(1)) {
        let mut stmt = conn.prepare_cached(&insert_sql(chunk.len()))?;
        let mut values: Vec<&dyn ToSql> = Vec::with_capacity(chunk.len() * COLUMNS_PER_ROW);
        for row in chunk {
            values.push(&row.entry.user_id);
            values.push(&row.device_id);
            values.push(&row.entry.encrypted_id);
            values.push(&row.entry.encrypted_data);
            values.push(&row.entry.nonce);
            values.push(&row.date);
            values.push(&row.is_from_same_device);
        }
        inserted += stmt.execute(values.as_slice())?;
    }
    Ok(inserted)
}

/// Insert one row per (device, entry) pair, flagging rows addressed back to
/// `origin_device_id`.
pub fn insert_for_devices(
    conn: &Connection,
    entries: &[EncHistoryEntry],
    device_ids: &[&str],
    origin_device_id: Option<&str>,
    chunk_size: usize,
) -> Result<usize, RelayError> {
    let dates = entries
        .iter()
        .map(|e| to_db_time(&e.date))
        .collect::<Result<Vec<_>, _>>()?;

    let mut rows = Vec::with_capacity(entries.len() * device_ids.len());
    for &device_id in device_ids {
        let is_from_same_device = origin_device_id == Some(device_id);
        for (entry, date) in entries.iter().zip(&dates) {
            rows.push(PendingRow {
                entry,
                device_id,
                date: *date,
                is_from_same_device,
            });
        }
    }
    insert_rows(conn, &rows, chunk_size)
}

/// Insert entries addressed to the device named in each entry.
pub fn insert_as_is(conn: &Connection, entries: &[EncHistoryEntry], chunk_size: usize) -> Result<usize, RelayError> {
    let rows = entries
        .iter()
        .map(|entry| {
            Ok(PendingRow {
                entry,
                device_id: &entry.device_id,
                date: to_db_time(&entry.date)?,
                is_from_same_device: false,
            })
        })
        .collect::<Result<Vec<_>, RelayError>>()?;
    insert_rows(conn, &rows, chunk_size)
}

/// Rows addressed to a device that it has not yet been sent `read_limit` times,
/// excluding its own writes.
pub fn pending_for_device(
    conn: &Connection,
    user_id: &str,
    device_id: &str,
    read_limit: u32,
) -> Result<Vec<EncHistoryEntry>, RelayError> {
    let sql = format!(
        "SELECT {} FROM enc_history_entries
         WHERE user_id = ?1 AND device_id = ?2 AND read_count < ?3 AND NOT is_from_same_device
         ORDER BY id",
        ENTRY_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map(params![user_id, device_id, read_limit], entry_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Every row of a user, regardless of destination or read count.
pub fn all_for_user(conn: &Connection, user_id: &str) -> Result<Vec<EncHistoryEntry>, RelayError> {
    let sql = format!(
        "SELECT {} FROM enc_history_entries WHERE user_id = ?1 ORDER BY id",
        ENTRY_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map([user_id], entry_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Bump the read count of every row addressed to a device.
///
/// Self-addressed rows are included so that they age out of storage too.
pub fn increment_read_counts(conn: &Connection, user_id: &str, device_id: &str) -> Result<usize, RelayError> {
    let updated = conn.execute(
        "UPDATE enc_history_entries SET read_count = read_count + 1
         WHERE user_id = ?1 AND device_id = ?2",
        params![user_id, device_id],
    )?;
    Ok(updated)
}

/// Delete every copy of the entries identified by `messages`, scoped to `user_id`.
///
/// A message matches on end time or entry id, since older clients never
/// recorded an entry id. Messages without a device id or without any usable
/// identifier are skipped. Deleting absent rows is a no-op.
pub fn delete_matching(
    conn: &Connection,
    user_id: &str,
    messages: &[MessageIdentifier],
) -> Result<usize, RelayError> {
    if user_id.is_empty() {
        return Err(RelayError::BadRequest(
            "Cannot delete entries without a user id".to_string(),
        ));
    }

    let mut stmt = conn.prepare_cached(
        "DELETE FROM enc_history_entries
         WHERE user_id = ?1
           AND ((?2 IS NOT NULL AND date = ?2) OR (?3 IS NOT NULL AND encrypted_id = ?3))",
    )?;

    let mut deleted = 0;
    for message in messages {
        if message.device_id.is_empty() {
            continue;
        }
        // Out-of-range end times cannot match any stored entry.
        let end_time = message
            .effective_end_time()
            .and_then(|t| t.timestamp_nanos_opt());
        let entry_id = message.effective_entry_id();
        if end_time.is_none() && entry_id.is_none() {
            tracing::warn!(
                user_id,
                device_id = %message.device_id,
                "Skipping deletion message with neither end time nor entry id"
            );
            continue;
        }
        deleted += stmt.execute(params![user_id, end_time, entry_id])?;
    }
    Ok(deleted)
}

pub fn delete_for_device(conn: &Connection, user_id: &str, device_id: &str) -> Result<usize, RelayError> {
    let deleted = conn.execute(
        "DELETE FROM enc_history_entries WHERE user_id = ?1 AND device_id = ?2",
        params![user_id, device_id],
    )?;
    Ok(deleted)
}

pub fn delete_read_more_than(conn: &Connection, read_count: u32) -> Result<usize, RelayError> {
    let deleted = conn.execute(
        "DELETE FROM enc_history_entries WHERE read_count > ?1",
        [read_count],
    )?;
    Ok(deleted)
}

/// Delete a user's rows dated at or before `cutoff`.
pub fn delete_older_than_for_user(
    conn: &Connection,
    user_id: &str,
    cutoff: &DateTime<Utc>,
) -> Result<usize, RelayError> {
    let deleted = conn.execute(
        "DELETE FROM enc_history_entries WHERE user_id = ?1 AND date <= ?2",
        params![user_id, to_db_time(cutoff)?],
    )?;
    Ok(deleted)
}

pub fn users_with_more_than(conn: &Connection, max_entries: u64) -> Result<Vec<String>, RelayError> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM enc_history_entries GROUP BY user_id HAVING COUNT(*) > ?1",
    )?;
    let users = stmt
        .query_map(params![max_entries as i64], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(users)
}

pub fn delete_all(conn: &Connection) -> Result<usize, RelayError> {
    Ok(conn.execute("DELETE FROM enc_history_entries", [])?)
}

pub fn count_all(conn: &Connection) -> Result<u64, RelayError> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM enc_history_entries", [], |row| row.get(0))?;
    Ok(count as u64)
}
