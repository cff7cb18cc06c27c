use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::Utc;
use serde_json::{json, Value};
use sysinfo::System;

use super::super::IPCServer;
use crate::server::{server_url, SERVER_HOST};

/// GET /api/status - liveness and metadata for the serving port
pub async fn status_handler(State(state): State<IPCServer>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "running",
            "timestamp": Utc::now(),
            "message": "LocalWrap core is running",
            "version": env!("CARGO_PKG_VERSION"),
            "port": state.port,
            "host": SERVER_HOST,
            "url": server_url(state.port),
        })),
    )
}

/// GET /api/health - uptime and memory of this process
pub async fn health_handler(State(state): State<IPCServer>) -> impl IntoResponse {
    // sysinfo scans the OS process table synchronously
    let memory = tokio::task::spawn_blocking(process_memory)
        .await
        .unwrap_or(Value::Null);

    (
        StatusCode::OK,
        Json(json!({
            "healthy": true,
            "uptime": state.app.started.elapsed().as_secs_f64(),
            "memory": memory,
            "platform": std::env::consts::OS,
        })),
    )
}

fn process_memory() -> Value {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return Value::Null;
    };
    let mut sys = System::new();
    sys.refresh_process(pid);
    match sys.process(pid) {
        Some(process) => json!({
            "rss": process.memory(),
            "virtual": process.virtual_memory(),
        }),
        None => Value::Null,
    }
}
