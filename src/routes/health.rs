//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/health` — liveness check.
///
/// Returns status, uptime, version, the number of online sessions and the
/// replay storage backend. No authentication required.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let sessions = state.orchestrator.registry().len();
    let replay = state.orchestrator.replay_provider();
    let storage_ok = replay.health_check().await.is_ok();

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": sessions,
        "storage": {
            "kind": replay.kind(),
            "ok": storage_ok,
        },
    }))
}
