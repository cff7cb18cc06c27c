pub mod handlers;
pub mod headers;
pub mod rate_limit;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::config::GlobalConfig;
use crate::error::{CoreError, CoreResult};
use crate::packager::Packager;
use crate::port;
use crate::script::ScriptRegistry;
use crate::server::{ServerRegistry, ServerStatus};

use handlers::{desktop, script, server, system};
use rate_limit::ClientRateLimit;

/// JSON request bodies above this are rejected.
pub const BODY_LIMIT: usize = 10 * 1024 * 1024;

/// Registries and configuration shared by every served port.
#[derive(Clone)]
pub struct AppState {
    pub servers: ServerRegistry,
    pub scripts: ScriptRegistry,
    pub packager: Packager,
    pub rate_limit: ClientRateLimit,
    pub config: Arc<GlobalConfig>,
    pub started: Instant,
}

impl AppState {
    pub fn new(config: GlobalConfig) -> Self {
        let servers = ServerRegistry::new(config.restart_delay());
        let scripts = ScriptRegistry::new(config.default_port, config.kill_grace());
        let packager = Packager::new(
            scripts.clone(),
            config.apps_dir.clone(),
            &config.install_command,
            &config.launch_command,
        );
        let rate_limit = ClientRateLimit::new(config.rate_limit_max, config.rate_limit_window());
        Self {
            servers,
            scripts,
            packager,
            rate_limit,
            config: Arc::new(config),
            started: Instant::now(),
        }
    }

    /// Start a server on `port` serving this state's route set.
    pub async fn start_server(&self, port: u16) -> CoreResult<ServerStatus> {
        self.servers.start(port, router(self.clone(), port)).await
    }

    pub async fn restart_server(&self, port: u16) -> CoreResult<ServerStatus> {
        self.servers.restart(port, router(self.clone(), port)).await
    }

    /// Stop every server and script. Used at process exit.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down: stopping servers and scripts");
        self.servers.shutdown_all().await;
        self.scripts.shutdown_all().await;
    }
}

/// Handler state: the shared registries plus the port this router serves.
#[derive(Clone)]
pub struct IPCServer {
    pub app: AppState,
    pub port: u16,
}

/// Route set served on every registered port.
pub fn router(app: AppState, port: u16) -> Router {
    let limit = app.rate_limit.clone();
    Router::new()
        .route("/api/status", get(system::status_handler))
        .route("/api/health", get(system::health_handler))
        .route("/api/servers", get(server::list_servers))
        .route("/api/servers/:port/start", post(server::start_server_handler))
        .route("/api/servers/:port/stop", post(server::stop_server_handler))
        .route("/api/servers/:port/restart", post(server::restart_server_handler))
        .route("/api/servers/:port/status", get(server::server_status_handler))
        .route("/api/script/execute", post(script::execute_handler))
        .route("/api/script/stop/:pid", post(script::stop_handler))
        .route("/api/script/output/:pid", get(script::output_handler))
        .route("/api/script/log/:pid", get(script::log_handler))
        .route("/api/scripts", get(script::list_handler))
        .route("/api/desktop-app/create", post(desktop::create_handler))
        .route_layer(middleware::from_fn_with_state(limit, rate_limit::limit_requests))
        .fallback(not_found)
        .with_state(IPCServer { app, port })
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(middleware::from_fn(headers::security_headers))
        .layer(TraceLayer::new_for_http())
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" })))
}

/// Port from a path segment; rejects anything outside 1000-65535.
pub(crate) fn parse_port_param(raw: &str) -> CoreResult<u16> {
    port::parse_user_port(raw).ok_or_else(|| {
        CoreError::InvalidInput("Invalid port number. Must be between 1000 and 65535".to_string())
    })
}

pub(crate) fn parse_pid_param(raw: &str) -> CoreResult<u32> {
    match raw.trim().parse::<u32>() {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(CoreError::InvalidInput("Invalid process ID".to_string())),
    }
}

/// Port from a JSON body field; accepts a number or a numeric string.
pub(crate) fn port_from_json(value: Option<&serde_json::Value>) -> CoreResult<u16> {
    let port = match value {
        Some(serde_json::Value::Number(n)) => n.as_i64().and_then(port::user_port),
        Some(serde_json::Value::String(s)) => port::parse_user_port(s),
        _ => None,
    };
    port.ok_or_else(|| {
        CoreError::InvalidInput("Invalid port number. Must be between 1000 and 65535".to_string())
    })
}
