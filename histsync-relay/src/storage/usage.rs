//! Usage ledger. Observational only; nothing in the sync protocol reads it.

#[cfg(test)]
use super::models::UsageData;
use super::{from_db_time, to_db_time};
use crate::error::RelayError;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

/// One request's worth of activity for a `(user, device)` pair.
#[derive(Debug, Clone)]
pub struct UsageEvent<'a> {
    pub user_id: &'a str,
    pub device_id: &'a str,
    pub at: DateTime<Utc>,
    pub ip: &'a str,
    pub version: &'a str,
    pub num_entries_handled: u64,
    pub is_query: bool,
}

/// Fold an event into the ledger row for its `(user, device)`.
pub fn record(conn: &Connection, event: &UsageEvent<'_>) -> Result<(), RelayError> {
    let at = to_db_time(&event.at)?;
    let last_queried = event.is_query.then_some(at);
    conn.execute(
        "INSERT INTO usage_data (user_id, device_id, last_used, last_ip, num_entries_handled,
                                 last_queried, num_queries, version)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(user_id, device_id) DO UPDATE SET
            last_used = excluded.last_used,
            last_ip = excluded.last_ip,
            num_entries_handled = num_entries_handled + excluded.num_entries_handled,
            last_queried = COALESCE(excluded.last_queried, last_queried),
            num_queries = num_queries + excluded.num_queries,
            version = CASE WHEN excluded.version = '' THEN version ELSE excluded.version END",
        params![
            event.user_id,
            event.device_id,
            at,
            event.ip,
            event.num_entries_handled as i64,
            last_queried,
            i64::from(event.is_query),
            event.version,
        ],
    )?;
    Ok(())
}

#[cfg(test)]
pub fn find(conn: &Connection, user_id: &str, device_id: &str) -> Result<Option<UsageData>, RelayError> {
    let mut stmt = conn.prepare(
        "SELECT user_id, device_id, last_used, last_ip, num_entries_handled,
                last_queried, num_queries, version
         FROM usage_data WHERE user_id = ?1 AND device_id = ?2",
    )?;
    let mut rows = stmt.query_map(params![user_id, device_id], |row| {
        Ok(UsageData {
            user_id: row.get(0)?,
            device_id: row.get(1)?,
            last_used: from_db_time(row.get(2)?),
            last_ip: row.get(3)?,
            num_entries_handled: row.get(4)?,
            last_queried: row.get::<_, Option<i64>>(5)?.map(from_db_time),
            num_queries: row.get(6)?,
            version: row.get(7)?,
        })
    })?;
    Ok(rows.next().transpose()?)
}

/// Users registered with more than one device whose every usage row is older
/// than `cutoff`. Users with no usage rows at all are not reported.
pub fn inactive_multi_device_users(conn: &Connection, cutoff: &DateTime<Utc>) -> Result<Vec<String>, RelayError> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM usage_data
         WHERE user_id IN (SELECT user_id FROM devices GROUP BY user_id HAVING COUNT(*) > 1)
         GROUP BY user_id
         HAVING MAX(last_used) <= ?1
         ORDER BY user_id",
    )?;
    let users = stmt
        .query_map([to_db_time(cutoff)?], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(users)
}

pub fn total_entries_handled(conn: &Connection) -> Result<i64, RelayError> {
    Ok(conn.query_row(
        "SELECT COALESCE(SUM(num_entries_handled), 0) FROM usage_data",
        [],
        |row| row.get(0),
    )?)
}

/// Devices that submitted or queried since `since`.
pub fn count_active_since(conn: &Connection, since: &DateTime<Utc>) -> Result<u64, RelayError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM usage_data WHERE last_used > ?1",
        [to_db_time(since)?],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Devices that queried since `since`.
pub fn count_queried_since(conn: &Connection, since: &DateTime<Utc>) -> Result<u64, RelayError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM usage_data WHERE last_queried > ?1",
        [to_db_time(since)?],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

#[derive(Debug, Clone, Serialize)]
pub struct UserUsageSummary {
    pub user_id: String,
    pub num_devices: u64,
    pub num_entries_handled: i64,
    pub num_queries: i64,
    pub last_used: DateTime<Utc>,
    pub last_queried: Option<DateTime<Utc>>,
    pub ip_addresses: Vec<String>,
    pub versions: Vec<String>,
}

fn split_list(joined: Option<String>) -> Vec<String> {
    let mut items: Vec<String> = joined
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    items.sort();
    items
}

/// Per-user rollup of the ledger, most recently active first.
pub fn user_summaries(conn: &Connection) -> Result<Vec<UserUsageSummary>, RelayError> {
    let mut stmt = conn.prepare(
        "SELECT user_id, COUNT(*), SUM(num_entries_handled), SUM(num_queries),
                MAX(last_used), MAX(last_queried),
                GROUP_CONCAT(DISTINCT last_ip), GROUP_CONCAT(DISTINCT version)
         FROM usage_data
         GROUP BY user_id
         ORDER BY MAX(last_used) DESC, user_id",
    )?;
    let summaries = stmt
        .query_map([], |row| {
            Ok(UserUsageSummary {
                user_id: row.get(0)?,
                num_devices: row.get::<_, i64>(1)? as u64,
                num_entries_handled: row.get(2)?,
                num_queries: row.get(3)?,
                last_used: from_db_time(row.get(4)?),
                last_queried: row.get::<_, Option<i64>>(5)?.map(from_db_time),
                ip_addresses: split_list(row.get(6)?),
                versions: split_list(row.get(7)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(summaries)
}
