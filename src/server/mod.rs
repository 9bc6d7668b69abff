// =============================================================================
// Status & Control API Server
// =============================================================================
//
// Axum surface consumed by the out-of-process monitor. Reads go through the
// StatusReader; controls are enqueued on daemon_control or toggle
// daemon_run_status, so the server never talks to the daemon process
// directly. GET /status never returns 5xx: on a read failure it reports
// blocked/red so the monitor shows the reason instead of an error page.
// =============================================================================

pub mod self_check;

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::db::{OperationFilter, StatusReader};
use self_check::{daemon_alive, derive_daemon_self_check, derive_self_check};

/// Shared server state.
pub struct ServerState {
    pub reader: StatusReader,
    /// From gates.state.system.data_lag_threshold_ms; feeds self_check.
    pub data_lag_threshold_ms: Option<f64>,
}

/// Build the router with CORS for the monitor frontend.
pub fn router(state: Arc<ServerState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/status", get(get_status))
        .route("/operations", get(get_operations))
        .route("/control/stop", post(control_stop))
        .route("/control/flatten", post(control_flatten))
        .route("/control/suspend", post(control_suspend))
        .route("/control/resume", post(control_resume))
        .route("/control/retry_ib", post(control_retry_ib))
        .route("/control/refresh_accounts", post(control_refresh_accounts))
        .route(
            "/control/set_heartbeat_interval",
            post(control_set_heartbeat_interval),
        )
        .route("/config/ib", post(config_ib))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// GET /status
// =============================================================================

async fn get_status(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let row = state.reader.get_status_current().await;
    let run_suspended = state.reader.get_run_status().await;
    let sc = derive_self_check(row.as_ref(), state.data_lag_threshold_ms, run_suspended);

    let mut payload = serde_json::json!({
        "self_check": sc.self_check,
        "block_reasons": sc.block_reasons,
        "status_lamp": sc.status_lamp,
        "trading_suspended": run_suspended.unwrap_or(false),
        "status": row,
    });
    let obj = payload.as_object_mut().expect("payload is an object");

    match state.reader.get_daemon_heartbeat().await {
        Some(hb) => {
            let now = chrono::Utc::now().timestamp() as f64;
            let alive = daemon_alive(hb.last_ts, now);
            let dsc = derive_daemon_self_check(Some((&hb, alive)));
            let mut hb_json = serde_json::to_value(&hb).unwrap_or_default();
            if let Some(hb_obj) = hb_json.as_object_mut() {
                hb_obj.insert("daemon_alive".to_string(), serde_json::Value::Bool(alive));
            }
            obj.insert("daemon_heartbeat".to_string(), hb_json);
            obj.insert(
                "daemon_self_check".to_string(),
                serde_json::json!(dsc.daemon_self_check),
            );
            obj.insert("daemon_lamp".to_string(), serde_json::json!(dsc.daemon_lamp));
            obj.insert(
                "daemon_block_reasons".to_string(),
                serde_json::json!(dsc.daemon_block_reasons),
            );
        }
        None => {
            let dsc = derive_daemon_self_check(None);
            obj.insert("daemon_heartbeat".to_string(), serde_json::Value::Null);
            obj.insert(
                "daemon_self_check".to_string(),
                serde_json::json!(dsc.daemon_self_check),
            );
            obj.insert("daemon_lamp".to_string(), serde_json::json!(dsc.daemon_lamp));
            obj.insert(
                "daemon_block_reasons".to_string(),
                serde_json::json!(dsc.daemon_block_reasons),
            );
        }
    }

    obj.insert(
        "accounts".to_string(),
        serde_json::json!(state.reader.get_accounts_from_tables().await),
    );
    obj.insert(
        "accounts_fetched_at".to_string(),
        serde_json::json!(state.reader.get_accounts_fetched_at().await),
    );
    obj.insert(
        "ib_config".to_string(),
        state.reader.get_ib_config().await.unwrap_or_else(|| {
            serde_json::json!({ "ib_host": "127.0.0.1", "ib_port_type": "tws_paper" })
        }),
    );

    Json(payload)
}

// =============================================================================
// GET /operations
// =============================================================================

fn default_limit() -> i64 {
    100
}

#[derive(Deserialize)]
struct OperationsQuery {
    #[serde(default)]
    since_ts: Option<f64>,
    #[serde(default)]
    until_ts: Option<f64>,
    #[serde(default, rename = "type")]
    op_type: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
}

async fn get_operations(
    State(state): State<Arc<ServerState>>,
    Query(q): Query<OperationsQuery>,
) -> impl IntoResponse {
    let ops = state
        .reader
        .get_operations(OperationFilter {
            since_ts: q.since_ts,
            until_ts: q.until_ts,
            op_type: q.op_type.as_deref(),
            limit: q.limit,
        })
        .await;
    Json(serde_json::json!({ "operations": ops }))
}

// =============================================================================
// POST /control/*
// =============================================================================

async fn enqueue(state: &ServerState, command: &str) -> impl IntoResponse {
    if state.reader.write_control_command(command).await {
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "ok": true,
                "message": format!("{command} written to daemon_control"),
            })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "ok": false, "error": "control write failed" })),
        )
    }
}

async fn control_stop(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    enqueue(&state, "stop").await
}

async fn control_flatten(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    enqueue(&state, "flatten").await
}

async fn control_retry_ib(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    enqueue(&state, "retry_ib").await
}

async fn control_refresh_accounts(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    enqueue(&state, "refresh_accounts").await
}

async fn control_suspend(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    if state.reader.write_run_status(true).await {
        info!("trading suspended via API");
        (
            StatusCode::OK,
            Json(serde_json::json!({ "ok": true, "suspended": true })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "ok": false, "error": "suspend write failed" })),
        )
    }
}

async fn control_resume(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    if state.reader.write_run_status(false).await {
        info!("trading resumed via API");
        (
            StatusCode::OK,
            Json(serde_json::json!({ "ok": true, "suspended": false })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "ok": false, "error": "resume write failed" })),
        )
    }
}

#[derive(Deserialize)]
struct HeartbeatIntervalRequest {
    heartbeat_interval_sec: i32,
}

async fn control_set_heartbeat_interval(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<HeartbeatIntervalRequest>,
) -> impl IntoResponse {
    match state
        .reader
        .write_heartbeat_interval(req.heartbeat_interval_sec)
        .await
    {
        Some(applied) => (
            StatusCode::OK,
            Json(serde_json::json!({ "ok": true, "heartbeat_interval_sec": applied })),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "ok": false, "error": "interval write failed" })),
        ),
    }
}

// =============================================================================
// POST /config/ib
// =============================================================================

#[derive(Deserialize)]
struct IbConfigRequest {
    ib_host: String,
    ib_port_type: String,
}

async fn config_ib(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<IbConfigRequest>,
) -> impl IntoResponse {
    let port_type = req.ib_port_type.trim().to_lowercase();
    if !matches!(port_type.as_str(), "tws_live" | "tws_paper" | "gateway") {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "ok": false,
                "error": format!(
                    "invalid ib_port_type '{}': use tws_live, tws_paper, or gateway",
                    req.ib_port_type
                ),
            })),
        );
    }
    let host = req.ib_host.trim();
    if host.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "ok": false, "error": "ib_host must not be empty" })),
        );
    }
    if state.reader.write_ib_config(host, &port_type).await {
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "ok": true,
                "ib_host": host,
                "ib_port_type": port_type,
            })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "ok": false, "error": "settings write failed" })),
        )
    }
}
