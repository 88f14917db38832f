//! Device registry queries.

use super::models::Device;
use super::{from_db_time, to_db_time};
use crate::error::RelayError;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, Row};

/// Devices whose uninstall date is unset or before this instant are active.
fn uninstall_sentinel() -> i64 {
    Utc.with_ymd_and_hms(1971, 1, 1, 0, 0, 0)
        .single()
        .and_then(|t| t.timestamp_nanos_opt())
        .unwrap_or(0)
}

const DEVICE_COLUMNS: &str = "user_id, device_id, registration_ip, registration_date,
                              is_integration_test_device, uninstall_date";

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<Device> {
    Ok(Device {
        user_id: row.get(0)?,
        device_id: row.get(1)?,
        registration_ip: row.get(2)?,
        registration_date: from_db_time(row.get(3)?),
        is_integration_test_device: row.get(4)?,
        uninstall_date: row.get::<_, Option<i64>>(5)?.map(from_db_time),
    })
}

/// Insert the device, or reactivate it if it was registered before.
pub fn upsert(conn: &Connection, device: &Device) -> Result<(), RelayError> {
    conn.execute(
        "INSERT INTO devices (user_id, device_id, registration_ip, registration_date,
                              is_integration_test_device, uninstall_date)
         VALUES (?1, ?2, ?3, ?4, ?5, NULL)
         ON CONFLICT(user_id, device_id) DO UPDATE SET
            uninstall_date = NULL",
        params![
            device.user_id,
            device.device_id,
            device.registration_ip,
            to_db_time(&device.registration_date)?,
            device.is_integration_test_device,
        ],
    )?;
    Ok(())
}

#[cfg(test)]
pub fn find(conn: &Connection, user_id: &str, device_id: &str) -> Result<Option<Device>, RelayError> {
    let sql = format!(
        "SELECT {} FROM devices WHERE user_id = ?1 AND device_id = ?2",
        DEVICE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query_map(params![user_id, device_id], device_from_row)?;
    Ok(rows.next().transpose()?)
}

/// Devices of `user_id` that have not been uninstalled.
pub fn active_for_user(conn: &Connection, user_id: &str) -> Result<Vec<Device>, RelayError> {
    let sql = format!(
        "SELECT {} FROM devices
         WHERE user_id = ?1 AND (uninstall_date IS NULL OR uninstall_date < ?2)
         ORDER BY registration_date, device_id",
        DEVICE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let devices = stmt
        .query_map(params![user_id, uninstall_sentinel()], device_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(devices)
}

/// Active devices of `user_id` other than `device_id`.
pub fn count_other_active(conn: &Connection, user_id: &str, device_id: &str) -> Result<u64, RelayError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM devices
         WHERE user_id = ?1 AND device_id != ?2
           AND (uninstall_date IS NULL OR uninstall_date < ?3)",
        params![user_id, device_id, uninstall_sentinel()],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

pub fn user_exists(conn: &Connection, user_id: &str) -> Result<bool, RelayError> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM devices WHERE user_id = ?1)",
        [user_id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

pub fn count_distinct_users(conn: &Connection) -> Result<u64, RelayError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(DISTINCT user_id) FROM devices",
        [],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

pub fn count_all(conn: &Connection) -> Result<u64, RelayError> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM devices", [], |row| row.get(0))?;
    Ok(count as u64)
}

pub fn last_registration(conn: &Connection) -> Result<Option<DateTime<Utc>>, RelayError> {
    let last: Option<i64> = conn.query_row(
        "SELECT MAX(registration_date) FROM devices",
        [],
        |row| row.get(0),
    )?;
    Ok(last.map(from_db_time))
}

/// Soft-delete a device. Returns whether a device row was updated.
pub fn mark_uninstalled(
    conn: &Connection,
    user_id: &str,
    device_id: &str,
    at: &DateTime<Utc>,
) -> Result<bool, RelayError> {
    let updated = conn.execute(
        "UPDATE devices SET uninstall_date = ?1 WHERE user_id = ?2 AND device_id = ?3",
        params![to_db_time(at)?, user_id, device_id],
    )?;
    Ok(updated > 0)
}

/// Integration-test devices registered at or before `cutoff` with no usage
/// after it.
pub fn inactive_integration_test_devices(
    conn: &Connection,
    cutoff: &DateTime<Utc>,
) -> Result<Vec<(String, String)>, RelayError> {
    let mut stmt = conn.prepare(
        "SELECT d.user_id, d.device_id FROM devices d
         LEFT JOIN usage_data u ON u.user_id = d.user_id AND u.device_id = d.device_id
         WHERE d.is_integration_test_device = 1
           AND d.registration_date <= ?1
           AND (u.last_used IS NULL OR u.last_used <= ?1)
         ORDER BY d.user_id, d.device_id",
    )?;
    let found = stmt
        .query_map([to_db_time(cutoff)?], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(found)
}

/// Hard-delete a device row. Only the deep clean does this.
pub fn delete(conn: &Connection, user_id: &str, device_id: &str) -> Result<bool, RelayError> {
    let deleted = conn.execute(
        "DELETE FROM devices WHERE user_id = ?1 AND device_id = ?2",
        params![user_id, device_id],
    )?;
    Ok(deleted > 0)
}
