use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use super::super::{port_from_json, IPCServer};
use crate::error::CoreError;

/// POST /api/desktop-app/create - `{port, appName}`
///
/// Blocks until the install step finishes; the launch that follows is not
/// awaited.
pub async fn create_handler(State(state): State<IPCServer>, payload: Option<Json<Value>>) -> Response {
    let payload = payload.map(|j| j.0).unwrap_or(json!({}));

    let port = match port_from_json(payload.get("port")) {
        Ok(p) => p,
        Err(e) => return e.into_response(),
    };
    let name = match payload.get("appName").and_then(|v| v.as_str()) {
        Some(name) => name.to_string(),
        None => return CoreError::InvalidInput("App name is required".to_string()).into_response(),
    };

    match state.app.packager.package(&name, port).await {
        Ok(app) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": format!("Desktop app '{}' created", app.name),
                "app": app,
            })),
        )
            .into_response(),
        Err(e) => {
            tracing::warn!("Failed to package app '{}' from port {}: {}", name, port, e);
            e.into_response()
        }
    }
}
