use localwrap_core::config::GlobalConfig;
use localwrap_core::ipc::AppState;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = GlobalConfig::load();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    tracing::info!("LocalWrap core starting");

    let port = cfg.default_port;
    let state = AppState::new(cfg);

    // Without the default server nothing can reach the core
    if let Err(e) = state.start_server(port).await {
        tracing::error!("Failed to start default server on port {}: {}", port, e);
        std::process::exit(1);
    }

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, cleaning up...");
    state.shutdown().await;

    tracing::info!("LocalWrap core stopped");
    Ok(())
}

/// Ctrl+C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
