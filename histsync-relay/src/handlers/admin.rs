//! Health, stats and operator endpoints.

use crate::engine::{RelayStats, SyncEngine};
use crate::error::RelayError;
use crate::storage::usage::UserUsageSummary;
use crate::sweeper::{self, SweepReport};
use axum::extract::State;
use axum::Json;

pub async fn healthcheck(State(engine): State<SyncEngine>) -> Result<&'static str, RelayError> {
    engine.storage().ping()?;
    Ok("OK")
}

/// Run one retention sweep now.
pub async fn trigger_cron(State(engine): State<SyncEngine>) -> Result<Json<SweepReport>, RelayError> {
    let report = sweeper::run_sweep(engine.storage(), engine.config())?;
    Ok(Json(report))
}

pub async fn stats(State(engine): State<SyncEngine>) -> Result<Json<RelayStats>, RelayError> {
    Ok(Json(engine.stats()?))
}

pub async fn usage_stats(State(engine): State<SyncEngine>) -> Result<Json<Vec<UserUsageSummary>>, RelayError> {
    Ok(Json(engine.usage_stats()?))
}

pub async fn wipe_db_entries(State(engine): State<SyncEngine>) -> Result<Json<serde_json::Value>, RelayError> {
    let wiped = engine.wipe_entries()?;
    Ok(Json(serde_json::json!({ "status": "wiped", "entries": wiped })))
}
