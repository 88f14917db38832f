//! Dump-request ledger.

use super::models::DumpRequest;
use super::{from_db_time, to_db_time};
use crate::error::RelayError;
use rusqlite::{params, Connection};

pub fn create(conn: &Connection, request: &DumpRequest) -> Result<(), RelayError> {
    conn.execute(
        "INSERT INTO dump_requests (user_id, requesting_device_id, request_time, read_count)
         VALUES (?1, ?2, ?3, 0)",
        params![
            request.user_id,
            request.requesting_device_id,
            to_db_time(&request.request_time)?,
        ],
    )?;
    Ok(())
}

/// Pending dump requests of a user, excluding those created by `device_id`
/// itself (a device never answers its own request).
pub fn pending_for_peer(conn: &Connection, user_id: &str, device_id: &str) -> Result<Vec<DumpRequest>, RelayError> {
    let mut stmt = conn.prepare(
        "SELECT user_id, requesting_device_id, request_time, read_count
         FROM dump_requests
         WHERE user_id = ?1 AND requesting_device_id != ?2
         ORDER BY id",
    )?;
    let requests = stmt
        .query_map(params![user_id, device_id], |row| {
            Ok(DumpRequest {
                user_id: row.get(0)?,
                requesting_device_id: row.get(1)?,
                request_time: from_db_time(row.get(2)?),
                read_count: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(requests)
}

/// Count a delivery of the requests returned by [`pending_for_peer`].
pub fn increment_read_counts(conn: &Connection, user_id: &str, device_id: &str) -> Result<usize, RelayError> {
    let updated = conn.execute(
        "UPDATE dump_requests SET read_count = read_count + 1
         WHERE user_id = ?1 AND requesting_device_id != ?2",
        params![user_id, device_id],
    )?;
    Ok(updated)
}

/// Remove the requests made by `requesting_device_id`.
pub fn delete_for_requester(
    conn: &Connection,
    user_id: &str,
    requesting_device_id: &str,
) -> Result<usize, RelayError> {
    let deleted = conn.execute(
        "DELETE FROM dump_requests WHERE user_id = ?1 AND requesting_device_id = ?2",
        params![user_id, requesting_device_id],
    )?;
    Ok(deleted)
}

pub fn delete_read_more_than(conn: &Connection, read_count: u32) -> Result<usize, RelayError> {
    Ok(conn.execute(
        "DELETE FROM dump_requests WHERE read_count > ?1",
        [read_count],
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RelayStorage;
    use chrono::Utc;

    fn request(user_id: &str, device_id: &str) -> DumpRequest {
        DumpRequest {
            user_id: user_id.to_string(),
            requesting_device_id: device_id.to_string(),
            request_time: Utc::now(),
            read_count: 0,
        }
    }

    #[test]
    fn pending_excludes_own_requests() {
        let storage = RelayStorage::in_memory().unwrap();
        let conn = storage.conn().unwrap();
        create(&conn, &request("u1", "d2")).unwrap();
        create(&conn, &request("u2", "x2")).unwrap();

        let for_d1 = pending_for_peer(&conn, "u1", "d1").unwrap();
        assert_eq!(for_d1.len(), 1);
        assert_eq!(for_d1[0].requesting_device_id, "d2");
        assert!(pending_for_peer(&conn, "u1", "d2").unwrap().is_empty());
        assert!(pending_for_peer(&conn, "nobody", "d1").unwrap().is_empty());
    }

    #[test]
    fn delete_for_requester_is_scoped() {
        let storage = RelayStorage::in_memory().unwrap();
        let conn = storage.conn().unwrap();
        create(&conn, &request("u1", "d2")).unwrap();
        create(&conn, &request("u2", "d2")).unwrap();

        assert_eq!(delete_for_requester(&conn, "u1", "d2").unwrap(), 1);
        assert!(pending_for_peer(&conn, "u1", "d1").unwrap().is_empty());
        assert_eq!(pending_for_peer(&conn, "u2", "d1").unwrap().len(), 1);
    }

    #[test]
    fn over_read_requests_are_swept() {
        let storage = RelayStorage::in_memory().unwrap();
        let conn = storage.conn().unwrap();
        create(&conn, &request("u1", "d2")).unwrap();
        for _ in 0..3 {
            increment_read_counts(&conn, "u1", "d1").unwrap();
        }
        assert_eq!(pending_for_peer(&conn, "u1", "d1").unwrap()[0].read_count, 3);
        assert_eq!(delete_read_more_than(&conn, 3).unwrap(), 0);
        assert_eq!(delete_read_more_than(&conn, 2).unwrap(), 1);
    }
}
