//! Background retention: read-count garbage collection plus the production
//! deep clean of stale users and integration-test devices.

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::storage::{deletion_requests, devices, dump_requests, entries, usage, RelayStorage};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub entries: usize,
    pub deletion_requests: usize,
    pub dump_requests: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeepCleanReport {
    pub inactive_users: usize,
    pub overgrown_users: usize,
    pub entries: usize,
    pub test_devices: usize,
}

/// Delete over-read entries and requests.
pub fn run_sweep(storage: &RelayStorage, config: &RelayConfig) -> Result<SweepReport, RelayError> {
    let conn = storage.conn()?;
    let report = SweepReport {
        entries: entries::delete_read_more_than(&conn, config.entry_gc_read_count)?,
        deletion_requests: deletion_requests::delete_read_more_than(&conn, config.deletion_gc_read_count)?,
        dump_requests: dump_requests::delete_read_more_than(&conn, config.dump_gc_read_count)?,
    };
    tracing::info!(
        entries = report.entries,
        deletion_requests = report.deletion_requests,
        dump_requests = report.dump_requests,
        "Retention sweep completed"
    );
    Ok(report)
}

/// Remove old entries of inactive multi-device users and of users storing
/// far too many rows, plus stale integration-test devices with everything
/// addressed to them.
pub fn run_deep_clean(
    storage: &RelayStorage,
    config: &RelayConfig,
    now: DateTime<Utc>,
) -> Result<DeepCleanReport, RelayError> {
    let cutoff = now - ChronoDuration::days(i64::from(config.inactive_retention_days));
    let mut conn = storage.conn()?;
    let tx = conn.transaction()?;
    let mut report = DeepCleanReport::default();

    let inactive = usage::inactive_multi_device_users(&tx, &cutoff)?;
    report.inactive_users = inactive.len();
    for user_id in &inactive {
        report.entries += entries::delete_older_than_for_user(&tx, user_id, &cutoff)?;
    }

    let overgrown = entries::users_with_more_than(&tx, config.max_entries_per_user)?;
    report.overgrown_users = overgrown.len();
    for user_id in &overgrown {
        report.entries += entries::delete_older_than_for_user(&tx, user_id, &cutoff)?;
    }

    for (user_id, device_id) in devices::inactive_integration_test_devices(&tx, &cutoff)? {
        report.entries += entries::delete_for_device(&tx, &user_id, &device_id)?;
        deletion_requests::delete_for_device(&tx, &user_id, &device_id)?;
        dump_requests::delete_for_requester(&tx, &user_id, &device_id)?;
        if devices::delete(&tx, &user_id, &device_id)? {
            report.test_devices += 1;
        }
    }
    tx.commit()?;

    tracing::info!(
        inactive_users = report.inactive_users,
        overgrown_users = report.overgrown_users,
        entries = report.entries,
        test_devices = report.test_devices,
        "Deep clean completed"
    );
    Ok(report)
}

/// Run the sweeps on their configured cadence. The deep clean only runs in
/// production. Failures are logged and the next tick tries again.
pub fn spawn_sweeper(storage: RelayStorage, config: Arc<RelayConfig>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sweep = time::interval(Duration::from_secs(config.sweep_interval_secs.max(1)));
        let mut deep_clean = time::interval(Duration::from_secs(config.deep_clean_interval_secs.max(1)));
        let deep_clean_enabled = config.environment.is_production();

        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    let storage = storage.clone();
                    let config = config.clone();
                    let result = tokio::task::spawn_blocking(move || run_sweep(&storage, &config)).await;
                    log_failure("Retention sweep", result);
                }
                _ = deep_clean.tick(), if deep_clean_enabled => {
                    let storage = storage.clone();
                    let config = config.clone();
                    let result =
                        tokio::task::spawn_blocking(move || run_deep_clean(&storage, &config, Utc::now())).await;
                    log_failure("Deep clean", result);
                }
            }
        }
    })
}

fn log_failure<T>(task: &str, result: Result<Result<T, RelayError>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "{} failed", task),
        Err(e) => tracing::error!(error = %e, "{} panicked", task),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;
    use crate::storage::models::{
        DeletionRequest, Device, DumpRequest, EncHistoryEntry, MessageIdentifiers,
    };
    use crate::storage::usage::UsageEvent;

    fn device(user_id: &str, device_id: &str, registered: DateTime<Utc>, test_device: bool) -> Device {
        Device {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            registration_ip: "127.0.0.1".to_string(),
            registration_date: registered,
            is_integration_test_device: test_device,
            uninstall_date: None,
        }
    }

    fn entry(user_id: &str, date: DateTime<Utc>) -> EncHistoryEntry {
        EncHistoryEntry {
            encrypted_data: vec![1, 2, 3],
            nonce: vec![0; 12],
            device_id: String::new(),
            user_id: user_id.to_string(),
            date,
            encrypted_id: format!("{}-{}", user_id, date.timestamp()),
            read_count: 0,
            is_from_same_device: false,
        }
    }

    fn used(conn: &rusqlite::Connection, user_id: &str, device_id: &str, at: DateTime<Utc>) {
        usage::record(
            conn,
            &UsageEvent {
                user_id,
                device_id,
                at,
                ip: "127.0.0.1",
                version: "v0.300",
                num_entries_handled: 0,
                is_query: false,
            },
        )
        .unwrap();
    }

    #[test]
    fn sweep_applies_thresholds() {
        let storage = RelayStorage::in_memory().unwrap();
        let config = RelayConfig::default();
        {
            let conn = storage.conn().unwrap();
            entries::insert_for_devices(&conn, &[entry("u1", Utc::now())], &["d1", "d2"], None, 1000)
                .unwrap();
            for _ in 0..11 {
                entries::increment_read_counts(&conn, "u1", "d1").unwrap();
            }
            for _ in 0..10 {
                entries::increment_read_counts(&conn, "u1", "d2").unwrap();
            }

            let request = DeletionRequest {
                user_id: "u1".to_string(),
                destination_device_id: String::new(),
                send_time: Utc::now(),
                read_count: 0,
                messages: MessageIdentifiers::default(),
            };
            deletion_requests::create_for_devices(&conn, &request, &["d1", "d2"]).unwrap();
            for _ in 0..101 {
                deletion_requests::increment_read_counts(&conn, "u1", "d1").unwrap();
            }
            dump_requests::create(
                &conn,
                &DumpRequest {
                    user_id: "u1".to_string(),
                    requesting_device_id: "d3".to_string(),
                    request_time: Utc::now(),
                    read_count: 0,
                },
            )
            .unwrap();
        }

        let report = run_sweep(&storage, &config).unwrap();
        assert_eq!(
            report,
            SweepReport {
                entries: 1,
                deletion_requests: 1,
                dump_requests: 0,
            }
        );
        let conn = storage.conn().unwrap();
        assert_eq!(entries::count_all(&conn).unwrap(), 1);
        assert_eq!(deletion_requests::for_device(&conn, "u1", "d2").unwrap().len(), 1);
    }

    #[test]
    fn deep_clean_targets_inactive_multi_device_users() {
        let storage = RelayStorage::in_memory().unwrap();
        let config = RelayConfig {
            environment: Environment::Production,
            ..RelayConfig::default()
        };
        let now = Utc::now();
        let long_ago = now - ChronoDuration::days(200);
        let recently = now - ChronoDuration::days(1);
        {
            let conn = storage.conn().unwrap();
            // Inactive user with two devices: old entries go, recent ones stay.
            devices::upsert(&conn, &device("idle", "a", long_ago, false)).unwrap();
            devices::upsert(&conn, &device("idle", "b", long_ago, false)).unwrap();
            used(&conn, "idle", "a", long_ago);
            used(&conn, "idle", "b", long_ago);
            entries::insert_for_devices(&conn, &[entry("idle", long_ago)], &["a", "b"], None, 1000).unwrap();
            entries::insert_for_devices(&conn, &[entry("idle", recently)], &["a", "b"], None, 1000).unwrap();

            // Active user keeps everything.
            devices::upsert(&conn, &device("busy", "a", long_ago, false)).unwrap();
            devices::upsert(&conn, &device("busy", "b", long_ago, false)).unwrap();
            used(&conn, "busy", "a", long_ago);
            used(&conn, "busy", "b", recently);
            entries::insert_for_devices(&conn, &[entry("busy", long_ago)], &["a", "b"], None, 1000).unwrap();

            // Single-device user keeps everything.
            devices::upsert(&conn, &device("solo", "a", long_ago, false)).unwrap();
            used(&conn, "solo", "a", long_ago);
            entries::insert_for_devices(&conn, &[entry("solo", long_ago)], &["a"], None, 1000).unwrap();
        }

        let report = run_deep_clean(&storage, &config, now).unwrap();
        assert_eq!(report.inactive_users, 1);
        assert_eq!(report.entries, 2);
        assert_eq!(report.test_devices, 0);

        let conn = storage.conn().unwrap();
        assert_eq!(entries::all_for_user(&conn, "idle").unwrap().len(), 2);
        assert_eq!(entries::all_for_user(&conn, "busy").unwrap().len(), 2);
        assert_eq!(entries::all_for_user(&conn, "solo").unwrap().len(), 1);
    }

    #[test]
    fn deep_clean_trims_overgrown_users() {
        let storage = RelayStorage::in_memory().unwrap();
        let config = RelayConfig {
            max_entries_per_user: 3,
            ..RelayConfig::default()
        };
        let now = Utc::now();
        let long_ago = now - ChronoDuration::days(200);
        {
            let conn = storage.conn().unwrap();
            devices::upsert(&conn, &device("hoarder", "a", long_ago, false)).unwrap();
            used(&conn, "hoarder", "a", now);
            let old: Vec<_> = (0..3).map(|i| entry("hoarder", long_ago + ChronoDuration::seconds(i))).collect();
            entries::insert_for_devices(&conn, &old, &["a"], None, 1000).unwrap();
            entries::insert_for_devices(&conn, &[entry("hoarder", now)], &["a"], None, 1000).unwrap();

            devices::upsert(&conn, &device("modest", "a", long_ago, false)).unwrap();
            used(&conn, "modest", "a", now);
            let old: Vec<_> = (0..3).map(|i| entry("modest", long_ago + ChronoDuration::seconds(i))).collect();
            entries::insert_for_devices(&conn, &old, &["a"], None, 1000).unwrap();
        }

        let report = run_deep_clean(&storage, &config, now).unwrap();
        assert_eq!(report.overgrown_users, 1);
        assert_eq!(report.inactive_users, 0);
        assert_eq!(report.entries, 3);

        let conn = storage.conn().unwrap();
        let kept = entries::all_for_user(&conn, "hoarder").unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].date.timestamp(), now.timestamp());
        assert_eq!(entries::all_for_user(&conn, "modest").unwrap().len(), 3);
    }

    #[test]
    fn deep_clean_removes_stale_test_devices() {
        let storage = RelayStorage::in_memory().unwrap();
        let config = RelayConfig::default();
        let now = Utc::now();
        let long_ago = now - ChronoDuration::days(200);
        {
            let conn = storage.conn().unwrap();
            devices::upsert(&conn, &device("ci", "t1", long_ago, true)).unwrap();
            devices::upsert(&conn, &device("ci", "t2", now, true)).unwrap();
            entries::insert_for_devices(&conn, &[entry("ci", now)], &["t1", "t2"], None, 1000).unwrap();
        }

        let report = run_deep_clean(&storage, &config, now).unwrap();
        assert_eq!(report.test_devices, 1);
        assert_eq!(report.entries, 1);

        let conn = storage.conn().unwrap();
        assert!(devices::find(&conn, "ci", "t1").unwrap().is_none());
        assert!(devices::find(&conn, "ci", "t2").unwrap().is_some());
    }

    #[tokio::test]
    async fn sweeper_runs_on_start() {
        let storage = RelayStorage::in_memory().unwrap();
        {
            let conn = storage.conn().unwrap();
            entries::insert_for_devices(&conn, &[entry("u1", Utc::now())], &["d1"], None, 1000).unwrap();
            for _ in 0..11 {
                entries::increment_read_counts(&conn, "u1", "d1").unwrap();
            }
        }

        let handle = spawn_sweeper(storage.clone(), Arc::new(RelayConfig::default()));
        let mut swept = false;
        for _ in 0..50 {
            if entries::count_all(&storage.conn().unwrap()).unwrap() == 0 {
                swept = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert!(swept);
    }
}
