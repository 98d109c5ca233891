// =============================================================================
// REST routes — liveness, readiness, status snapshot, admin mode switch
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::types::TradingMode;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/v1/status", get(status))
        .route("/api/v1/admin/mode", post(set_mode))
        .route("/ws", get(crate::api::ws::ws_handler))
        .with_state(state)
}

/// Liveness: the process accepted the connection and can respond. Never
/// touches a store or a broker.
async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Readiness: the durable store is reachable and at least one broker adapter
/// is configured. A 503 here tells an orchestrator to hold traffic, not to
/// restart the process.
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let today = state.clock.today();
    let store_ok = state.store.get_or_create_daily_stats(&today).await.is_ok();
    let brokers_ok = !state.brokers.is_empty();

    if store_ok && brokers_ok {
        (axum::http::StatusCode::OK, Json(json!({ "status": "ready" })))
    } else {
        (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not ready",
                "store_reachable": store_ok,
                "brokers_configured": brokers_ok,
            })),
        )
    }
}

async fn status(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.build_status_snapshot().await {
        Ok(snapshot) => (axum::http::StatusCode::OK, Json(serde_json::to_value(snapshot).unwrap())),
        Err(e) => {
            state.push_error(format!("status snapshot failed: {e}"));
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}

#[derive(Debug, Deserialize)]
struct SetModeRequest {
    mode: TradingMode,
}

async fn set_mode(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(body): Json<SetModeRequest>,
) -> impl IntoResponse {
    state.set_trading_mode(body.mode);
    Json(json!({ "trading_mode": body.mode, "state_version": state.current_state_version() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::util::ServiceExt;

    #[tokio::test]
    async fn healthz_is_public_and_ok() {
        let app = Router::new().route("/healthz", get(healthz));
        let resp = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
