// src/orchestrator/api.rs

//! HTTP control surface for the orchestrator.
//!
//! Control handlers return as soon as the command is posted to the
//! target's channel; progress is observed through the status endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::orchestrator::logs::{read_line_range, tail_file};
use crate::orchestrator::{ControlError, Orchestrator};

/// Build the API router. The caller mounts it under a prefix, typically
/// `/api`.
pub fn routes(orch: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/targets", get(handle_list_targets))
        .route("/targets/{name}", get(handle_get_target))
        .route("/targets/{name}/build", post(handle_build))
        .route("/targets/{name}/start", post(handle_start_exec))
        .route("/targets/{name}/stop", post(handle_stop_exec))
        .route("/targets/{name}/restart", post(handle_restart))
        .route("/targets/{name}/enable", post(handle_enable))
        .route("/targets/{name}/disable", post(handle_disable))
        .route("/targets/{name}/logs", get(handle_logs))
        .with_state(orch)
}

/// Bind and serve the API until the token is cancelled.
pub async fn serve(orch: Arc<Orchestrator>, cancel: CancellationToken) -> anyhow::Result<()> {
    let port = orch.port();
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| anyhow::anyhow!("bind API port {port}: {e}"))?;

    info!(port, "API listening");

    let app = Router::new().nest("/api", routes(orch));
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

fn error_response(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(json!({ "error": msg.into() }))).into_response()
}

fn control_error(err: ControlError) -> Response {
    match err {
        ControlError::NotFound(_) => {
            error_response(StatusCode::NOT_FOUND, err.to_string())
        }
    }
}

async fn handle_health() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn handle_list_targets(State(orch): State<Arc<Orchestrator>>) -> Response {
    Json(orch.status()).into_response()
}

async fn handle_get_target(
    State(orch): State<Arc<Orchestrator>>,
    Path(name): Path<String>,
) -> Response {
    match orch.target_status(&name) {
        Ok(status) => Json(status).into_response(),
        Err(err) => control_error(err),
    }
}

async fn handle_build(
    State(orch): State<Arc<Orchestrator>>,
    Path(name): Path<String>,
) -> Response {
    match orch.build_target(&name) {
        Ok(()) => Json(json!({ "status": "building" })).into_response(),
        Err(err) => control_error(err),
    }
}

async fn handle_start_exec(
    State(orch): State<Arc<Orchestrator>>,
    Path(name): Path<String>,
) -> Response {
    match orch.start_exec(&name) {
        Ok(()) => Json(json!({ "status": "started" })).into_response(),
        Err(err) => control_error(err),
    }
}

async fn handle_stop_exec(
    State(orch): State<Arc<Orchestrator>>,
    Path(name): Path<String>,
) -> Response {
    match orch.stop_exec(&name) {
        Ok(()) => Json(json!({ "status": "stopped" })).into_response(),
        Err(err) => control_error(err),
    }
}

async fn handle_restart(
    State(orch): State<Arc<Orchestrator>>,
    Path(name): Path<String>,
) -> Response {
    match orch.restart_target(&name) {
        Ok(()) => Json(json!({ "status": "restarting" })).into_response(),
        Err(err) => control_error(err),
    }
}

async fn handle_enable(
    State(orch): State<Arc<Orchestrator>>,
    Path(name): Path<String>,
) -> Response {
    match orch.enable_target(&name) {
        Ok(()) => Json(json!({ "status": "enabled" })).into_response(),
        Err(err) => match err.downcast_ref::<ControlError>() {
            Some(ControlError::NotFound(_)) => {
                error_response(StatusCode::NOT_FOUND, format!("{err:#}"))
            }
            None => error_response(StatusCode::BAD_REQUEST, format!("{err:#}")),
        },
    }
}

async fn handle_disable(
    State(orch): State<Arc<Orchestrator>>,
    Path(name): Path<String>,
) -> Response {
    match orch.disable_target(&name) {
        Ok(()) => Json(json!({ "status": "disabled" })).into_response(),
        Err(err) => control_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default)]
    stage: Option<String>,
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
    /// Legacy tail mode: last N lines.
    #[serde(default)]
    lines: Option<usize>,
}

async fn handle_logs(
    State(orch): State<Arc<Orchestrator>>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Response {
    let logs = match orch.target_logs(&name) {
        Ok(logs) => logs,
        Err(err) => return control_error(err),
    };
    let Some(logs) = logs else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "no logs configured for this target",
        );
    };

    let stage = query.stage.as_deref().unwrap_or("run");
    let path = match stage {
        "build" => logs.build,
        "run" => logs.run,
        _ => {
            return error_response(StatusCode::BAD_REQUEST, "stage must be build or run");
        }
    };

    if query.offset.is_some() || query.limit.is_some() {
        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(500);
        return match read_line_range(&path, offset, limit) {
            Ok((lines, total)) => Json(json!({
                "lines": lines,
                "totalLines": total,
                "offset": offset,
                "file": path,
            }))
            .into_response(),
            Err(err) => {
                error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
            }
        };
    }

    let n = query.lines.unwrap_or(200);
    match tail_file(&path, n) {
        Ok(lines) => Json(json!({ "lines": lines, "file": path })).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")),
    }
}
