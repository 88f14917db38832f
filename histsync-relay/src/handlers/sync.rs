//! Submit, query and bootstrap handlers.

use super::params::{self, DeviceParams, QueryParams, SubmitParams};
use crate::engine::SyncEngine;
use crate::error::RelayError;
use crate::storage::models::{EncHistoryEntry, SubmitResponse};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;

pub async fn submit(
    State(engine): State<SyncEngine>,
    headers: HeaderMap,
    query: Result<Query<SubmitParams>, QueryRejection>,
    body: Result<Json<Vec<EncHistoryEntry>>, JsonRejection>,
) -> Result<Json<SubmitResponse>, RelayError> {
    let Query(query) = query?;
    let Json(batch) = body?;
    let strict = engine.config().environment.is_test();
    let source_device_id = params::optional(&query.source_device_id, "source_device_id", strict)?;
    tracing::debug!(entries = batch.len(), ?source_device_id, "Submit");

    let response = engine.submit(&batch, source_device_id, &params::client_info(&headers))?;
    Ok(Json(response))
}

pub async fn query(
    State(engine): State<SyncEngine>,
    headers: HeaderMap,
    query: Result<Query<QueryParams>, QueryRejection>,
) -> Result<Json<Vec<EncHistoryEntry>>, RelayError> {
    let Query(query) = query?;
    let user_id = params::required(&query.user_id, "user_id")?;
    let device_id = params::required(&query.device_id, "device_id")?;
    let strict = engine.config().environment.is_test();
    let query_reason = params::optional(&query.query_reason, "queryReason", strict)?;

    let found = engine.query(user_id, device_id, query_reason, &params::client_info(&headers))?;
    Ok(Json(found))
}

pub async fn bootstrap(
    State(engine): State<SyncEngine>,
    headers: HeaderMap,
    query: Result<Query<DeviceParams>, QueryRejection>,
) -> Result<Json<Vec<EncHistoryEntry>>, RelayError> {
    let Query(query) = query?;
    let user_id = params::required(&query.user_id, "user_id")?;
    let device_id = params::required(&query.device_id, "device_id")?;

    let all = engine.bootstrap(user_id, device_id, &params::client_info(&headers))?;
    Ok(Json(all))
}
