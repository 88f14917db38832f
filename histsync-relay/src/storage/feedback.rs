//! Uninstall feedback.

use super::models::Feedback;
use super::to_db_time;
use crate::error::RelayError;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

pub fn create(conn: &Connection, feedback: &Feedback) -> Result<(), RelayError> {
    conn.execute(
        "INSERT INTO feedbacks (user_id, date, feedback) VALUES (?1, ?2, ?3)",
        params![feedback.user_id, to_db_time(&feedback.date)?, feedback.feedback],
    )?;
    Ok(())
}

/// Uninstalls reported since `since`, ignoring users with integration-test devices.
pub fn count_since(conn: &Connection, since: &DateTime<Utc>) -> Result<u64, RelayError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM feedbacks
         WHERE date > ?1
           AND user_id NOT IN (SELECT user_id FROM devices WHERE is_integration_test_device)",
        params![to_db_time(since)?],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}
