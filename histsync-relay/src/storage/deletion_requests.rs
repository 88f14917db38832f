//! Deletion-request (tombstone) ledger. One row per destination device.

use super::models::{DeletionRequest, MessageIdentifiers};
use super::{from_db_time, to_db_time};
use crate::error::RelayError;
use rusqlite::{params, Connection};

/// Persist a copy of `request` addressed to each of `device_ids`, with a fresh
/// read count.
pub fn create_for_devices(
    conn: &Connection,
    request: &DeletionRequest,
    device_ids: &[&str],
) -> Result<usize, RelayError> {
    let messages = serde_json::to_string(&request.messages)?;
    let send_time = to_db_time(&request.send_time)?;
    let mut stmt = conn.prepare_cached(
        "INSERT INTO deletion_requests
            (user_id, destination_device_id, send_time, read_count, messages)
         VALUES (?1, ?2, ?3, 0, ?4)",
    )?;
    let mut created = 0;
    for device_id in device_ids {
        created += stmt.execute(params![request.user_id, device_id, send_time, messages])?;
    }
    Ok(created)
}

pub fn for_device(conn: &Connection, user_id: &str, device_id: &str) -> Result<Vec<DeletionRequest>, RelayError> {
    let mut stmt = conn.prepare(
        "SELECT user_id, destination_device_id, send_time, read_count, messages
         FROM deletion_requests
         WHERE user_id = ?1 AND destination_device_id = ?2
         ORDER BY id",
    )?;
    let rows = stmt
        .query_map(params![user_id, device_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, u32>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(user_id, destination_device_id, send_time, read_count, messages)| {
            let messages: MessageIdentifiers = serde_json::from_str(&messages)?;
            Ok(DeletionRequest {
                user_id,
                destination_device_id,
                send_time: from_db_time(send_time),
                read_count,
                messages,
            })
        })
        .collect()
}

pub fn increment_read_counts(conn: &Connection, user_id: &str, device_id: &str) -> Result<usize, RelayError> {
    let updated = conn.execute(
        "UPDATE deletion_requests SET read_count = read_count + 1
         WHERE user_id = ?1 AND destination_device_id = ?2",
        params![user_id, device_id],
    )?;
    Ok(updated)
}

pub fn delete_for_device(conn: &Connection, user_id: &str, device_id: &str) -> Result<usize, RelayError> {
    Ok(conn.execute(
        "DELETE FROM deletion_requests WHERE user_id = ?1 AND destination_device_id = ?2",
        params![user_id, device_id],
    )?)
}

pub fn delete_read_more_than(conn: &Connection, read_count: u32) -> Result<usize, RelayError> {
    Ok(conn.execute(
        "DELETE FROM deletion_requests WHERE read_count > ?1",
        [read_count],
    )?)
}
