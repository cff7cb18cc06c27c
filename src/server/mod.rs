//! Server Registry - embedded HTTP servers keyed by port.
//!
//! The registry is the only owner of each listener. All mutations happen
//! while holding the registry lock, so two concurrent `start` calls for
//! the same port cannot both succeed and a `stop` followed by `start`
//! never races a listener that is still closing.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, CoreResult};
use crate::port;

/// Host name reported in URLs; listeners always bind 127.0.0.1.
pub const SERVER_HOST: &str = "localhost";

/// How long `stop` waits for in-flight requests before aborting the
/// accept task. A request that stops its own server always hits this.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Running,
    Stopped,
}

struct ServerEntry {
    started_at: DateTime<Utc>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// Status snapshot of a single port
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub port: u16,
    pub status: ServerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// Milliseconds since start
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<i64>,
}

impl ServerStatus {
    fn stopped(port: u16) -> Self {
        Self {
            port,
            status: ServerState::Stopped,
            url: None,
            start_time: None,
            uptime: None,
        }
    }

    fn running(port: u16, started_at: DateTime<Utc>) -> Self {
        Self {
            port,
            status: ServerState::Running,
            url: Some(server_url(port)),
            start_time: Some(started_at),
            uptime: Some((Utc::now() - started_at).num_milliseconds().max(0)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ServerState::Running
    }
}

pub fn server_url(port: u16) -> String {
    format!("http://{}:{}", SERVER_HOST, port)
}

#[derive(Clone)]
pub struct ServerRegistry {
    servers: Arc<Mutex<HashMap<u16, ServerEntry>>>,
    restart_delay: Duration,
}

impl ServerRegistry {
    pub fn new(restart_delay: Duration) -> Self {
        Self {
            servers: Arc::new(Mutex::new(HashMap::new())),
            restart_delay,
        }
    }

    /// Bind `port` on the loopback interface and serve `router` on it.
    pub async fn start(&self, port: u16, router: Router) -> CoreResult<ServerStatus> {
        let mut servers = self.servers.lock().await;

        if servers.contains_key(&port) {
            return Err(CoreError::AlreadyRunning(port));
        }
        if !port::is_available(port as i64) {
            return Err(CoreError::PortUnavailable(port));
        }

        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(|source| CoreError::Bind { port, source })?;

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let task = tokio::spawn(async move {
            // Peer address feeds the per-client rate limit
            let result = axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await;
            if let Err(e) = result {
                tracing::error!("Server on port {} failed: {}", port, e);
            }
        });

        let started_at = Utc::now();
        servers.insert(port, ServerEntry { started_at, shutdown, task });
        tracing::info!("Server started on {}", server_url(port));

        Ok(ServerStatus::running(port, started_at))
    }

    /// Close the listener on `port` and forget it. Returns once the socket
    /// has been released.
    pub async fn stop(&self, port: u16) -> CoreResult<()> {
        let mut servers = self.servers.lock().await;

        let entry = servers.get_mut(&port).ok_or(CoreError::ServerNotRunning(port))?;
        entry.shutdown.cancel();

        if tokio::time::timeout(SHUTDOWN_GRACE, &mut entry.task).await.is_err() {
            tracing::warn!(
                "Server on port {} still had open requests after {:?}, aborting",
                port,
                SHUTDOWN_GRACE
            );
            entry.task.abort();
            let _ = (&mut entry.task).await;
        }

        servers.remove(&port);
        tracing::info!("Server stopped on port {}", port);
        Ok(())
    }

    /// `stop`, a fixed grace delay for socket teardown, then `start`.
    pub async fn restart(&self, port: u16, router: Router) -> CoreResult<ServerStatus> {
        self.stop(port).await?;
        tokio::time::sleep(self.restart_delay).await;
        let status = self.start(port, router).await?;
        tracing::info!("Server restarted on port {}", port);
        Ok(status)
    }

    /// Never fails: an unknown port reports `stopped`.
    pub async fn status(&self, port: u16) -> ServerStatus {
        let servers = self.servers.lock().await;
        match servers.get(&port) {
            Some(entry) => ServerStatus::running(port, entry.started_at),
            None => ServerStatus::stopped(port),
        }
    }

    pub async fn status_all(&self) -> Vec<ServerStatus> {
        let servers = self.servers.lock().await;
        let mut list: Vec<ServerStatus> = servers
            .iter()
            .map(|(port, entry)| ServerStatus::running(*port, entry.started_at))
            .collect();
        list.sort_by_key(|s| s.port);
        list
    }

    pub async fn count(&self) -> usize {
        self.servers.lock().await.len()
    }

    /// Stop every registered server. Used at process shutdown.
    pub async fn shutdown_all(&self) {
        let ports: Vec<u16> = self.servers.lock().await.keys().copied().collect();
        for port in ports {
            if let Err(e) = self.stop(port).await {
                tracing::warn!("Failed to stop server on port {} during shutdown: {}", port, e);
            }
        }
    }
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    fn test_router() -> Router {
        Router::new().route("/ping", get(|| async { "pong" }))
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let registry = ServerRegistry::default();
        let port = free_port();

        registry.start(port, test_router()).await.unwrap();
        let second = registry.start(port, test_router()).await;
        assert!(matches!(second, Err(CoreError::AlreadyRunning(p)) if p == port));
        assert_eq!(registry.count().await, 1);

        registry.stop(port).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_starts_single_winner() {
        let registry = ServerRegistry::default();
        let port = free_port();

        let (a, b) = tokio::join!(
            registry.start(port, test_router()),
            registry.start(port, test_router())
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        assert_eq!(registry.count().await, 1);

        registry.stop(port).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_then_start_immediately() {
        let registry = ServerRegistry::default();
        let port = free_port();

        let first = registry.start(port, test_router()).await.unwrap();
        registry.stop(port).await.unwrap();
        let second = registry.start(port, test_router()).await.unwrap();

        assert!(second.is_running());
        assert_ne!(first.start_time, second.start_time);
        registry.stop(port).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_unknown_port() {
        let registry = ServerRegistry::default();
        let result = registry.stop(9321).await;
        assert!(matches!(result, Err(CoreError::ServerNotRunning(9321))));
    }

    #[tokio::test]
    async fn test_status_of_absent_port_is_stopped() {
        let registry = ServerRegistry::default();
        let status = registry.status(4567).await;
        assert_eq!(status.status, ServerState::Stopped);
        assert!(status.url.is_none());

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json, serde_json::json!({ "port": 4567, "status": "stopped" }));
    }

    #[tokio::test]
    async fn test_port_taken_by_other_listener() {
        let registry = ServerRegistry::default();
        let other = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = other.local_addr().unwrap().port();

        let result = registry.start(port, test_router()).await;
        assert!(matches!(result, Err(CoreError::PortUnavailable(p)) if p == port));
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_restart_keeps_serving() {
        let registry = ServerRegistry::new(Duration::from_millis(50));
        let port = free_port();

        registry.start(port, test_router()).await.unwrap();
        let status = registry.restart(port, test_router()).await.unwrap();
        assert!(status.is_running());
        assert_eq!(registry.status_all().await.len(), 1);

        let body = reqwest::get(format!("http://127.0.0.1:{}/ping", port))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "pong");

        registry.stop(port).await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_of_stopped_port_fails_without_start() {
        let registry = ServerRegistry::new(Duration::from_millis(10));
        let port = free_port();

        let result = registry.restart(port, test_router()).await;
        assert!(matches!(result, Err(CoreError::ServerNotRunning(_))));
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_all() {
        let registry = ServerRegistry::default();
        registry.start(free_port(), test_router()).await.unwrap();
        registry.start(free_port(), test_router()).await.unwrap();
        assert_eq!(registry.count().await, 2);

        registry.shutdown_all().await;
        assert_eq!(registry.count().await, 0);
    }
}
