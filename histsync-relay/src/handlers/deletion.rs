//! Deletion-request handlers.

use super::params::{self, DeviceParams};
use crate::engine::SyncEngine;
use crate::error::RelayError;
use crate::storage::models::DeletionRequest;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::Json;

pub async fn add_deletion_request(
    State(engine): State<SyncEngine>,
    body: Result<Json<DeletionRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, RelayError> {
    let Json(request) = body?;
    tracing::debug!(
        user_id = %request.user_id,
        messages = request.messages.ids.len(),
        "Received deletion request"
    );
    let deleted = engine.add_deletion_request(request)?;
    Ok(Json(serde_json::json!({ "status": "recorded", "deleted": deleted })))
}

pub async fn get_deletion_requests(
    State(engine): State<SyncEngine>,
    query: Result<Query<DeviceParams>, QueryRejection>,
) -> Result<Json<Vec<DeletionRequest>>, RelayError> {
    let Query(query) = query?;
    let user_id = params::required(&query.user_id, "user_id")?;
    let device_id = params::required(&query.device_id, "device_id")?;
    Ok(Json(engine.deletion_requests(user_id, device_id)?))
}
