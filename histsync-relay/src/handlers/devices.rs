//! Device registration, uninstall and uninstall-feedback handlers.

use super::params::{self, DeviceParams, RegisterParams};
use crate::engine::{DeviceRegistration, RegistrationOutcome, SyncEngine};
use crate::error::RelayError;
use crate::storage::models::Feedback;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;

pub async fn register_device(
    State(engine): State<SyncEngine>,
    headers: HeaderMap,
    query: Result<Query<RegisterParams>, QueryRejection>,
) -> Result<Json<RegistrationOutcome>, RelayError> {
    let Query(query) = query?;
    let registration = DeviceRegistration {
        user_id: params::required(&query.user_id, "user_id")?.to_string(),
        device_id: params::required(&query.device_id, "device_id")?.to_string(),
        is_integration_test_device: params::is_true(query.is_integration_test_device.as_deref()),
    };
    let outcome = engine.register_device(&registration, &params::client_info(&headers))?;
    Ok(Json(outcome))
}

pub async fn uninstall_device(
    State(engine): State<SyncEngine>,
    query: Result<Query<DeviceParams>, QueryRejection>,
) -> Result<Json<serde_json::Value>, RelayError> {
    let Query(query) = query?;
    let user_id = params::required(&query.user_id, "user_id")?;
    let device_id = params::required(&query.device_id, "device_id")?;
    let removed = engine.uninstall(user_id, device_id)?;
    Ok(Json(serde_json::json!({ "status": "uninstalled", "removed": removed })))
}

pub async fn feedback(
    State(engine): State<SyncEngine>,
    body: Result<Json<Feedback>, JsonRejection>,
) -> Result<Json<serde_json::Value>, RelayError> {
    let Json(report) = body?;
    engine.record_feedback(&report)?;
    Ok(Json(serde_json::json!({ "status": "recorded" })))
}
