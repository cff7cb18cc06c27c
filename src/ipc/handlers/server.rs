use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use super::super::{parse_port_param, IPCServer};

/// GET /api/servers - every registered server
pub async fn list_servers(State(state): State<IPCServer>) -> impl IntoResponse {
    let servers = state.app.servers.status_all().await;
    let total = servers.len();
    (StatusCode::OK, Json(json!({ "servers": servers, "total": total })))
}

/// POST /api/servers/:port/start
pub async fn start_server_handler(
    Path(port): Path<String>,
    State(state): State<IPCServer>,
) -> Response {
    let port = match parse_port_param(&port) {
        Ok(p) => p,
        Err(e) => return e.into_response(),
    };

    match state.app.start_server(port).await {
        Ok(status) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": format!("Server started on port {}", port),
                "server": status,
            })),
        )
            .into_response(),
        Err(e) => {
            tracing::warn!("Failed to start server on port {}: {}", port, e);
            e.into_response()
        }
    }
}

/// POST /api/servers/:port/stop - may target the server handling this request
pub async fn stop_server_handler(
    Path(port): Path<String>,
    State(state): State<IPCServer>,
) -> Response {
    let port = match parse_port_param(&port) {
        Ok(p) => p,
        Err(e) => return e.into_response(),
    };

    match state.app.servers.stop(port).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": format!("Server stopped on port {}", port),
            })),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /api/servers/:port/restart
pub async fn restart_server_handler(
    Path(port): Path<String>,
    State(state): State<IPCServer>,
) -> Response {
    let port = match parse_port_param(&port) {
        Ok(p) => p,
        Err(e) => return e.into_response(),
    };

    match state.app.restart_server(port).await {
        Ok(status) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": format!("Server restarted on port {}", port),
                "server": status,
            })),
        )
            .into_response(),
        Err(e) => {
            tracing::warn!("Failed to restart server on port {}: {}", port, e);
            e.into_response()
        }
    }
}

/// GET /api/servers/:port/status - `stopped` for unknown ports
pub async fn server_status_handler(
    Path(port): Path<String>,
    State(state): State<IPCServer>,
) -> Response {
    match parse_port_param(&port) {
        Ok(port) => (StatusCode::OK, Json(state.app.servers.status(port).await)).into_response(),
        Err(e) => e.into_response(),
    }
}
