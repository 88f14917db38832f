//! Axum router setup.

use crate::engine::SyncEngine;
use crate::handlers::{admin, deletion, devices, dump, sync};
use axum::extract::DefaultBodyLimit;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use std::any::Any;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

pub fn build_router(engine: SyncEngine) -> Router {
    let max_payload_size = engine.config().max_payload_size;

    let api = Router::new()
        .route("/api/v1/register", post(devices::register_device))
        .route("/api/v1/uninstall", post(devices::uninstall_device))
        .route("/api/v1/feedback", post(devices::feedback))
        .route("/api/v1/submit", post(sync::submit))
        .route("/api/v1/query", get(sync::query))
        .route("/api/v1/bootstrap", get(sync::bootstrap))
        .route("/api/v1/submit-dump", post(dump::submit_dump))
        .route("/api/v1/get-dump-requests", get(dump::get_dump_requests))
        .route("/api/v1/add-deletion-request", post(deletion::add_deletion_request))
        .route("/api/v1/get-deletion-requests", get(deletion::get_deletion_requests));

    let ops = Router::new()
        .route("/healthcheck", get(admin::healthcheck))
        .route("/api/v1/trigger-cron", post(admin::trigger_cron))
        .route("/api/v1/wipe-db-entries", post(admin::wipe_db_entries))
        .route("/internal/api/v1/stats", get(admin::stats))
        .route("/internal/api/v1/usage-stats", get(admin::usage_stats));

    Router::new()
        .merge(api)
        .merge(ops)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(max_payload_size))
        .layer(RequestBodyLimitLayer::new(max_payload_size))
        .layer(CatchPanicLayer::custom(handle_panic))
        .with_state(engine)
}

/// Turn a handler panic into the same 503 clients get for any server-side
/// failure, instead of dropping the connection.
fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(panic = %detail, "Handler panicked");

    (
        StatusCode::SERVICE_UNAVAILABLE,
        [(header::CONTENT_TYPE, "application/json")],
        r#"{"error":"Service unavailable"}"#,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::engine::{ClientInfo, DeviceRegistration};
    use crate::storage::models::EncHistoryEntry;
    use crate::storage::RelayStorage;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn engine(config: RelayConfig) -> SyncEngine {
        let engine = SyncEngine::new(RelayStorage::in_memory().unwrap(), Arc::new(config));
        engine
            .register_device(
                &DeviceRegistration {
                    user_id: "u1".to_string(),
                    device_id: "d1".to_string(),
                    is_integration_test_device: false,
                },
                &ClientInfo::default(),
            )
            .unwrap();
        engine
    }

    fn submit_request(payload_bytes: usize) -> Request<Body> {
        let batch = vec![EncHistoryEntry {
            encrypted_data: vec![7; payload_bytes],
            nonce: vec![0; 12],
            device_id: "d1".to_string(),
            user_id: "u1".to_string(),
            date: Utc::now(),
            encrypted_id: "big".to_string(),
            read_count: 0,
            is_from_same_device: false,
        }];
        let body = serde_json::to_vec(&batch).unwrap();
        Request::builder()
            .method("POST")
            .uri("/api/v1/submit?source_device_id=d1")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CONTENT_LENGTH, body.len())
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn large_submit_is_accepted_up_to_configured_limit() {
        let engine = engine(RelayConfig::default());
        let response = build_router(engine.clone())
            .oneshot(submit_request(3 * 1024 * 1024))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(engine.stats().unwrap().num_db_entries, 1);
    }

    #[tokio::test]
    async fn submit_over_configured_limit_is_refused() {
        let engine = engine(RelayConfig {
            max_payload_size: 1024 * 1024,
            ..RelayConfig::default()
        });
        let response = build_router(engine.clone())
            .oneshot(submit_request(2 * 1024 * 1024))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(engine.stats().unwrap().num_db_entries, 0);
    }

    #[test]
    fn panics_become_503() {
        let response = handle_panic(Box::new("boom"));
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let response = handle_panic(Box::new(String::from("boom")));
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let response = handle_panic(Box::new(42_u8));
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
