mod backend;
mod classifier;
mod config;
mod hint;
mod metrics;
mod monitor;
mod protocol;
mod router;
mod session;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinSet;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use classifier::{Classify, KeywordClassifier};
use config::Config;
use monitor::{ServerMonitor, ServerRegistry};
use session::Session;

/// Global connection counter for generating unique session IDs
static CONNECTION_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Graceful shutdown timeout (wait for sessions to drain)
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = Arc::new(load_or_default_config());

    if config.backends.is_empty() {
        anyhow::bail!("No backend servers configured");
    }

    // shared server roster, fed by the monitor
    let registry = Arc::new(ServerRegistry::new());
    for backend in &config.backends {
        registry.register(&backend.name, &backend.addr());
    }

    let monitor = ServerMonitor::new(
        registry.clone(),
        config.backends.clone(),
        config.monitor.clone(),
    );
    let monitor_token = monitor.spawn();

    info!(
        servers = ?config.backends.iter().map(|b| b.name.as_str()).collect::<Vec<_>>(),
        "Backend servers configured"
    );

    let classifier: Arc<dyn Classify> = Arc::new(KeywordClassifier);

    let addr = format!("{}:{}", config.server.listen_addr, config.server.listen_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Hermes MySQL proxy listening");

    // metrics endpoint next to the proxy port
    let metrics_addr = format!(
        "{}:{}",
        config.server.listen_addr,
        config.server.listen_port + 1000
    );
    info!(metrics_addr = %metrics_addr, "Metrics server starting");
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(&metrics_addr).await {
            error!(error = %e, "Metrics server failed");
        }
    });

    let mut sessions: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("Shutdown signal received, stopping accept loop");
                break;
            }

            accept_result = listener.accept() => {
                let (stream, peer_addr) = match accept_result {
                    Ok(v) => v,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };

                let session_id = CONNECTION_COUNTER.fetch_add(1, Ordering::SeqCst);
                let session = Session::new(
                    session_id,
                    config.clone(),
                    registry.clone(),
                    classifier.clone(),
                );

                info!(session_id = session_id, peer = %peer_addr, "New connection");
                metrics::metrics().record_connection_accepted();

                sessions.spawn(async move {
                    if let Err(e) = session.run(stream).await {
                        warn!(session_id = session_id, error = %e, "Session ended with error");
                    } else {
                        info!(session_id = session_id, "Session ended");
                    }
                    metrics::metrics().record_connection_closed();
                });
            }
        }
    }

    // graceful shutdown: wait for active sessions to finish
    let active = sessions.len();
    if active > 0 {
        info!(
            active_sessions = active,
            timeout_secs = GRACEFUL_SHUTDOWN_TIMEOUT.as_secs(),
            "Waiting for active sessions to complete"
        );

        let deadline = tokio::time::Instant::now() + GRACEFUL_SHUTDOWN_TIMEOUT;

        loop {
            if sessions.is_empty() {
                info!("All sessions completed gracefully");
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        remaining_sessions = sessions.len(),
                        "Graceful shutdown timeout, aborting remaining sessions"
                    );
                    sessions.abort_all();
                    break;
                }

                Some(result) = sessions.join_next() => {
                    if let Err(e) = result {
                        if !e.is_cancelled() {
                            error!(error = %e, "Session task panicked");
                        }
                    }
                }
            }
        }
    }

    monitor_token.cancel();
    info!("Hermes proxy shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn load_or_default_config() -> Config {
    let config_paths = ["config/hermes.toml", "hermes.toml"];

    for path in config_paths {
        match config::load_config(path) {
            Ok(config) => {
                info!(path = path, "Loaded configuration");
                return config;
            }
            Err(e) => {
                warn!(path = path, error = %e, "Failed to load config");
            }
        }
    }

    info!("Using default configuration");
    Config::default()
}
