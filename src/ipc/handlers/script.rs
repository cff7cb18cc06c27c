use std::path::PathBuf;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use super::super::{parse_pid_param, port_from_json, IPCServer};
use crate::error::{CoreError, CoreResult};

/// POST /api/script/execute - `{script, port, workingDir?}`
pub async fn execute_handler(
    State(state): State<IPCServer>,
    payload: Option<Json<Value>>,
) -> Response {
    let payload = payload.map(|j| j.0).unwrap_or(json!({}));

    let (command, port, working_dir) = match parse_execute_request(&payload) {
        Ok(parsed) => parsed,
        Err(e) => return e.into_response(),
    };

    match state
        .app
        .scripts
        .execute(&command, port, working_dir.as_deref())
        .await
    {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "pid": outcome.pid,
                "effectivePort": outcome.effective_port,
                "portMessage": outcome.port_message,
            })),
        )
            .into_response(),
        Err(e) => {
            tracing::warn!("Failed to execute '{}': {}", command, e);
            e.into_response()
        }
    }
}

fn parse_execute_request(payload: &Value) -> CoreResult<(String, u16, Option<PathBuf>)> {
    let command = payload
        .get("script")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CoreError::InvalidInput("Script command is required".to_string()))?;

    let port = port_from_json(payload.get("port"))?;

    let working_dir = payload
        .get("workingDir")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from);

    Ok((command.to_string(), port, working_dir))
}

/// POST /api/script/stop/:pid
pub async fn stop_handler(Path(pid): Path<String>, State(state): State<IPCServer>) -> Response {
    let pid = match parse_pid_param(&pid) {
        Ok(pid) => pid,
        Err(e) => return e.into_response(),
    };

    match state.app.scripts.stop(pid).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": format!("Process {} terminated", pid),
            })),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /api/script/output/:pid - records since the previous poll
pub async fn output_handler(Path(pid): Path<String>, State(state): State<IPCServer>) -> Response {
    let pid = match parse_pid_param(&pid) {
        Ok(pid) => pid,
        Err(e) => return e.into_response(),
    };

    match state.app.scripts.output(pid).await {
        Ok(chunk) => (StatusCode::OK, Json(chunk)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /api/script/log/:pid - whole retained log, does not advance the poll cursor
pub async fn log_handler(Path(pid): Path<String>, State(state): State<IPCServer>) -> Response {
    let pid = match parse_pid_param(&pid) {
        Ok(pid) => pid,
        Err(e) => return e.into_response(),
    };

    match state.app.scripts.full_output(pid).await {
        Ok(chunk) => (StatusCode::OK, Json(chunk)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /api/scripts
pub async fn list_handler(State(state): State<IPCServer>) -> impl IntoResponse {
    let scripts = state.app.scripts.list().await;
    let total = scripts.len();
    (StatusCode::OK, Json(json!({ "scripts": scripts, "total": total })))
}
