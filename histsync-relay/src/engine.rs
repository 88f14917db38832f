//! Synchronization engine.
//!
//! Every operation runs against the relay's single SQLite connection. Writes
//! that must be all-or-nothing (fan-out, dump ingest, tombstone creation)
//! run inside one transaction; usage bookkeeping happens afterwards and never
//! affects the outcome in production.

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::storage::models::{
    DeletionRequest, Device, DumpRequest, EncHistoryEntry, Feedback, SubmitResponse,
};
use crate::storage::usage::{self, UsageEvent, UserUsageSummary};
use crate::storage::{deletion_requests, devices, dump_requests, entries, feedback, RelayStorage};
use crate::version::ClientCapabilities;
use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::sync::Arc;

pub const UNKNOWN_IP: &str = "UnknownIp";

/// Query reasons sent by clients for background refreshes. These do not
/// count as user activity.
const BACKGROUND_QUERY_REASONS: [&str; 2] = ["preload", "newclient"];

/// What the relay knows about the calling client.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub version: String,
    pub ip: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            version: String::new(),
            ip: UNKNOWN_IP.to_string(),
        }
    }
}

impl ClientInfo {
    pub fn capabilities(&self) -> ClientCapabilities {
        ClientCapabilities::from_version_header(&self.version)
    }
}

#[derive(Debug, Clone)]
pub struct DeviceRegistration {
    pub user_id: String,
    pub device_id: String,
    pub is_integration_test_device: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistrationOutcome {
    /// Active devices of the user other than the one registering.
    pub existing_devices: u64,
    pub dump_requested: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayStats {
    pub num_users: u64,
    pub num_devices: u64,
    pub num_entries_processed: i64,
    pub num_db_entries: u64,
    pub weekly_active_installs: u64,
    pub weekly_active_queriers: u64,
    pub daily_uninstalls: u64,
    pub last_registration: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct SyncEngine {
    storage: RelayStorage,
    config: Arc<RelayConfig>,
}

fn require_id(name: &str, value: &str) -> Result<(), RelayError> {
    if value.is_empty() {
        return Err(RelayError::BadRequest(format!("{} must not be empty", name)));
    }
    Ok(())
}

impl SyncEngine {
    pub fn new(storage: RelayStorage, config: Arc<RelayConfig>) -> Self {
        Self { storage, config }
    }

    pub fn storage(&self) -> &RelayStorage {
        &self.storage
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Register (or reinstall) a device.
    ///
    /// A user that already has other active devices gets a dump request so
    /// that a peer uploads its full history to the new device.
    pub fn register_device(
        &self,
        registration: &DeviceRegistration,
        client: &ClientInfo,
    ) -> Result<RegistrationOutcome, RelayError> {
        require_id("user_id", &registration.user_id)?;
        require_id("device_id", &registration.device_id)?;

        let mut conn = self.storage.conn()?;
        let tx = conn.transaction()?;

        if let Some(max_users) = self.config.max_users {
            if !devices::user_exists(&tx, &registration.user_id)? {
                let num_users = devices::count_distinct_users(&tx)?;
                if num_users >= max_users {
                    return Err(RelayError::Precondition(format!(
                        "Refusing to register a new user: {} users registered, limit is {}",
                        num_users, max_users
                    )));
                }
            }
        }

        let now = Utc::now();
        let existing_devices =
            devices::count_other_active(&tx, &registration.user_id, &registration.device_id)?;
        devices::upsert(
            &tx,
            &Device {
                user_id: registration.user_id.clone(),
                device_id: registration.device_id.clone(),
                registration_ip: client.ip.clone(),
                registration_date: now,
                is_integration_test_device: registration.is_integration_test_device,
                uninstall_date: None,
            },
        )?;

        let dump_requested = existing_devices > 0;
        if dump_requested {
            dump_requests::create(
                &tx,
                &DumpRequest {
                    user_id: registration.user_id.clone(),
                    requesting_device_id: registration.device_id.clone(),
                    request_time: now,
                    read_count: 0,
                },
            )?;
        }
        tx.commit()?;

        tracing::info!(
            user_id = %registration.user_id,
            device_id = %registration.device_id,
            existing_devices,
            dump_requested,
            "Registered device"
        );

        self.record_usage(&conn, &registration.user_id, &registration.device_id, client, 0, false)?;

        Ok(RegistrationOutcome {
            existing_devices,
            dump_requested,
        })
    }

    /// Fan a batch out to every active device of its user.
    ///
    /// Entries carry no idempotency key: resubmitting a batch stores it again.
    pub fn submit(
        &self,
        batch: &[EncHistoryEntry],
        source_device_id: Option<&str>,
        client: &ClientInfo,
    ) -> Result<SubmitResponse, RelayError> {
        let Some(first) = batch.first() else {
            tracing::debug!("Ignoring empty submit");
            return Ok(SubmitResponse::default());
        };
        let user_id = first.user_id.as_str();
        require_id("user_id", user_id)?;
        if let Some(other) = batch.iter().find(|e| e.user_id != user_id) {
            return Err(RelayError::BadRequest(format!(
                "Batch mixes user ids {} and {}",
                user_id, other.user_id
            )));
        }
        let source_device_id = source_device_id.filter(|id| !id.is_empty());

        let mut conn = self.storage.conn()?;
        let tx = conn.transaction()?;

        let active = devices::active_for_user(&tx, user_id)?;
        if active.is_empty() {
            return Err(RelayError::Precondition(format!(
                "No devices registered for user {}, cannot store entries",
                user_id
            )));
        }
        let device_ids: Vec<&str> = active.iter().map(|d| d.device_id.as_str()).collect();
        let inserted = entries::insert_for_devices(
            &tx,
            batch,
            &device_ids,
            source_device_id,
            self.config.insert_chunk_size,
        )?;

        let mut response = SubmitResponse::default();
        if let Some(origin) = source_device_id {
            if client.capabilities().structured_submit_response {
                let pending_dumps = dump_requests::pending_for_peer(&tx, user_id, origin)?;
                dump_requests::increment_read_counts(&tx, user_id, origin)?;
                let pending_deletions = deletion_requests::for_device(&tx, user_id, origin)?;
                deletion_requests::increment_read_counts(&tx, user_id, origin)?;
                response.dump_requests = Some(pending_dumps);
                response.deletion_requests = Some(pending_deletions);
            }
        }
        tx.commit()?;

        tracing::info!(
            user_id,
            entries = batch.len(),
            devices = device_ids.len(),
            rows = inserted,
            "Stored submitted entries"
        );

        let usage_device = source_device_id.unwrap_or(first.device_id.as_str());
        self.record_usage(&conn, user_id, usage_device, client, batch.len() as u64, false)?;
        Ok(response)
    }

    /// Entries waiting for `device_id`, after applying its pending deletions.
    ///
    /// Each returned row's read count is bumped afterwards. In production the
    /// bump runs detached from the request and may race with a concurrent
    /// query, so a row can be delivered more than `query_read_limit` times.
    pub fn query(
        &self,
        user_id: &str,
        device_id: &str,
        query_reason: Option<&str>,
        client: &ClientInfo,
    ) -> Result<Vec<EncHistoryEntry>, RelayError> {
        require_id("user_id", user_id)?;
        require_id("device_id", device_id)?;
        let is_background = query_reason.is_some_and(|r| BACKGROUND_QUERY_REASONS.contains(&r));

        let pending = {
            let mut conn = self.storage.conn()?;
            if !is_background {
                self.record_usage(&conn, user_id, device_id, client, 0, true)?;
            }

            let tx = conn.transaction()?;
            let mut deleted = 0;
            for request in deletion_requests::for_device(&tx, user_id, device_id)? {
                deleted += entries::delete_matching(&tx, &request.user_id, &request.messages.ids)?;
            }
            tx.commit()?;
            if deleted > 0 {
                tracing::debug!(user_id, device_id, deleted, "Applied pending deletions");
            }

            entries::pending_for_device(&conn, user_id, device_id, self.config.query_read_limit)?
        };
        tracing::debug!(user_id, device_id, found = pending.len(), "Query");

        if self.config.environment.is_production() {
            self.spawn_read_count_increment(user_id, device_id);
        } else {
            let conn = self.storage.conn()?;
            entries::increment_read_counts(&conn, user_id, device_id)?;
        }
        Ok(pending)
    }

    /// Best-effort, fire-and-forget read count bump. Failures are logged only.
    fn spawn_read_count_increment(&self, user_id: &str, device_id: &str) {
        let storage = self.storage.clone();
        let user_id = user_id.to_string();
        let device_id = device_id.to_string();
        let increment = move || {
            let result = storage
                .conn()
                .and_then(|conn| entries::increment_read_counts(&conn, &user_id, &device_id));
            if let Err(e) = result {
                tracing::warn!(%user_id, %device_id, error = %e, "Failed to increment read counts");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let _ = handle.spawn_blocking(increment);
            }
            Err(_) => increment(),
        }
    }

    /// Every stored row of the user, regardless of destination or read count.
    pub fn bootstrap(
        &self,
        user_id: &str,
        device_id: &str,
        client: &ClientInfo,
    ) -> Result<Vec<EncHistoryEntry>, RelayError> {
        require_id("user_id", user_id)?;
        require_id("device_id", device_id)?;
        let conn = self.storage.conn()?;
        self.record_usage(&conn, user_id, device_id, client, 0, false)?;
        let all = entries::all_for_user(&conn, user_id)?;
        tracing::info!(user_id, device_id, found = all.len(), "Bootstrap");
        Ok(all)
    }

    /// Store a peer's history upload for `requesting_device_id`.
    ///
    /// The dump request is kept while `is_chunk` is set so later chunks still
    /// see it; the final upload removes it.
    pub fn submit_dump(
        &self,
        user_id: &str,
        source_device_id: &str,
        requesting_device_id: &str,
        is_chunk: bool,
        mut dump: Vec<EncHistoryEntry>,
        client: &ClientInfo,
    ) -> Result<usize, RelayError> {
        require_id("user_id", user_id)?;
        require_id("source_device_id", source_device_id)?;
        require_id("requesting_device_id", requesting_device_id)?;

        for entry in &mut dump {
            if entry.user_id != user_id {
                return Err(RelayError::BadRequest(format!(
                    "Dump contains an entry for user {} but user_id is {}",
                    entry.user_id, user_id
                )));
            }
            entry.device_id = requesting_device_id.to_string();
        }

        let mut conn = self.storage.conn()?;
        let tx = conn.transaction()?;
        let inserted = entries::insert_as_is(&tx, &dump, self.config.insert_chunk_size)?;
        if !is_chunk {
            dump_requests::delete_for_requester(&tx, user_id, requesting_device_id)?;
        }
        tx.commit()?;

        tracing::info!(
            user_id,
            source_device_id,
            requesting_device_id,
            is_chunk,
            rows = inserted,
            "Stored history dump"
        );

        self.record_usage(&conn, user_id, source_device_id, client, dump.len() as u64, false)?;
        Ok(inserted)
    }

    /// Dump requests that `device_id` can answer.
    pub fn pending_dump_requests(&self, user_id: &str, device_id: &str) -> Result<Vec<DumpRequest>, RelayError> {
        require_id("user_id", user_id)?;
        require_id("device_id", device_id)?;
        let mut conn = self.storage.conn()?;
        let tx = conn.transaction()?;
        let pending = dump_requests::pending_for_peer(&tx, user_id, device_id)?;
        dump_requests::increment_read_counts(&tx, user_id, device_id)?;
        tx.commit()?;
        Ok(pending)
    }

    /// Record a tombstone for every active device of the user and delete the
    /// matching rows right away. Returns the number of rows deleted.
    pub fn add_deletion_request(&self, request: DeletionRequest) -> Result<usize, RelayError> {
        require_id("user_id", &request.user_id)?;
        // Messages without a device id are ignored when applied, so only the rest must match.
        if let Some(bad) = request
            .messages
            .ids
            .iter()
            .find(|m| !m.device_id.is_empty() && !m.is_matchable())
        {
            return Err(RelayError::BadRequest(format!(
                "Deletion message for device {:?} has neither an end time nor an entry id",
                bad.device_id
            )));
        }

        let mut conn = self.storage.conn()?;
        let tx = conn.transaction()?;
        let active = devices::active_for_user(&tx, &request.user_id)?;
        if active.is_empty() {
            return Err(RelayError::Precondition(format!(
                "No devices registered for user {}, cannot record deletion",
                request.user_id
            )));
        }
        let device_ids: Vec<&str> = active.iter().map(|d| d.device_id.as_str()).collect();
        let request = DeletionRequest {
            read_count: 0,
            ..request
        };
        deletion_requests::create_for_devices(&tx, &request, &device_ids)?;
        let deleted = entries::delete_matching(&tx, &request.user_id, &request.messages.ids)?;
        tx.commit()?;

        tracing::info!(
            user_id = %request.user_id,
            messages = request.messages.ids.len(),
            devices = device_ids.len(),
            deleted,
            "Added deletion request"
        );
        Ok(deleted)
    }

    /// Deletion requests addressed to `device_id`, counting this delivery.
    pub fn deletion_requests(&self, user_id: &str, device_id: &str) -> Result<Vec<DeletionRequest>, RelayError> {
        require_id("user_id", user_id)?;
        require_id("device_id", device_id)?;
        let mut conn = self.storage.conn()?;
        let tx = conn.transaction()?;
        deletion_requests::increment_read_counts(&tx, user_id, device_id)?;
        let requests = deletion_requests::for_device(&tx, user_id, device_id)?;
        tx.commit()?;
        Ok(requests)
    }

    /// Drop everything addressed to a device and soft-delete it.
    pub fn uninstall(&self, user_id: &str, device_id: &str) -> Result<usize, RelayError> {
        require_id("user_id", user_id)?;
        require_id("device_id", device_id)?;
        let mut conn = self.storage.conn()?;
        let tx = conn.transaction()?;
        let mut removed = entries::delete_for_device(&tx, user_id, device_id)?;
        removed += deletion_requests::delete_for_device(&tx, user_id, device_id)?;
        removed += dump_requests::delete_for_requester(&tx, user_id, device_id)?;
        let known = devices::mark_uninstalled(&tx, user_id, device_id, &Utc::now())?;
        tx.commit()?;

        if known {
            tracing::info!(user_id, device_id, removed, "Uninstalled device");
        } else {
            tracing::warn!(user_id, device_id, removed, "Uninstall for unknown device");
        }
        Ok(removed)
    }

    pub fn record_feedback(&self, report: &Feedback) -> Result<(), RelayError> {
        require_id("user_id", &report.user_id)?;
        let conn = self.storage.conn()?;
        feedback::create(&conn, report)?;
        tracing::info!(user_id = %report.user_id, "Recorded uninstall feedback");
        Ok(())
    }

    pub fn stats(&self) -> Result<RelayStats, RelayError> {
        let conn = self.storage.conn()?;
        let now = Utc::now();
        let week_ago = now - Duration::days(7);
        Ok(RelayStats {
            num_users: devices::count_distinct_users(&conn)?,
            num_devices: devices::count_all(&conn)?,
            num_entries_processed: usage::total_entries_handled(&conn)?,
            num_db_entries: entries::count_all(&conn)?,
            weekly_active_installs: usage::count_active_since(&conn, &week_ago)?,
            weekly_active_queriers: usage::count_queried_since(&conn, &week_ago)?,
            daily_uninstalls: feedback::count_since(&conn, &(now - Duration::days(1)))?,
            last_registration: devices::last_registration(&conn)?,
        })
    }

    pub fn usage_stats(&self) -> Result<Vec<UserUsageSummary>, RelayError> {
        let conn = self.storage.conn()?;
        usage::user_summaries(&conn)
    }

    /// Delete every stored entry. Only allowed in the test environment.
    pub fn wipe_entries(&self) -> Result<usize, RelayError> {
        if !self.config.environment.is_test() {
            return Err(RelayError::BadRequest(
                "Wiping entries is only allowed in the test environment".to_string(),
            ));
        }
        let conn = self.storage.conn()?;
        let wiped = entries::delete_all(&conn)?;
        tracing::warn!(wiped, "Wiped all history entries");
        Ok(wiped)
    }

    fn record_usage(
        &self,
        conn: &Connection,
        user_id: &str,
        device_id: &str,
        client: &ClientInfo,
        num_entries_handled: u64,
        is_query: bool,
    ) -> Result<(), RelayError> {
        if !self.config.track_usage_data {
            return Ok(());
        }
        let event = UsageEvent {
            user_id,
            device_id,
            at: Utc::now(),
            ip: &client.ip,
            version: &client.version,
            num_entries_handled,
            is_query,
        };
        self.handle_non_critical(usage::record(conn, &event))
    }

    /// Swallow bookkeeping failures in production; surface them elsewhere so
    /// they get noticed before release.
    fn handle_non_critical(&self, result: Result<(), RelayError>) -> Result<(), RelayError> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if self.config.environment.is_production() => {
                tracing::warn!(error = %e, "Ignoring non-critical error");
                Ok(())
            }
            Err(e) => Err(RelayError::NonCritical(e.to_string())),
        }
    }
}
