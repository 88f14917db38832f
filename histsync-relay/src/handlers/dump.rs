//! Dump-request recovery handlers.

use super::params::{self, DeviceParams, SubmitDumpParams};
use crate::engine::SyncEngine;
use crate::error::RelayError;
use crate::storage::models::{DumpRequest, EncHistoryEntry};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;

/// Accept a peer's history upload on behalf of `requesting_device_id`.
pub async fn submit_dump(
    State(engine): State<SyncEngine>,
    headers: HeaderMap,
    query: Result<Query<SubmitDumpParams>, QueryRejection>,
    body: Result<Json<Vec<EncHistoryEntry>>, JsonRejection>,
) -> Result<Json<serde_json::Value>, RelayError> {
    let Query(query) = query?;
    let Json(dump) = body?;
    let user_id = params::required(&query.user_id, "user_id")?;
    let source_device_id = params::required(&query.source_device_id, "source_device_id")?;
    let requesting_device_id = params::required(&query.requesting_device_id, "requesting_device_id")?;
    let strict = engine.config().environment.is_test();
    let is_chunk = params::is_true(params::optional(&query.is_chunk, "is_chunk", strict)?);

    let stored = engine.submit_dump(
        user_id,
        source_device_id,
        requesting_device_id,
        is_chunk,
        dump,
        &params::client_info(&headers),
    )?;
    Ok(Json(serde_json::json!({ "status": "stored", "rows": stored })))
}

pub async fn get_dump_requests(
    State(engine): State<SyncEngine>,
    query: Result<Query<DeviceParams>, QueryRejection>,
) -> Result<Json<Vec<DumpRequest>>, RelayError> {
    let Query(query) = query?;
    let user_id = params::required(&query.user_id, "user_id")?;
    let device_id = params::required(&query.device_id, "device_id")?;
    Ok(Json(engine.pending_dump_requests(user_id, device_id)?))
}
