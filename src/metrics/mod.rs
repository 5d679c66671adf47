//! Prometheus metrics for the Hermes proxy.
//!
//! Exposes metrics via HTTP endpoint for Prometheus scraping.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

pub struct Metrics {
    pub registry: Registry,

    /// Total client connections accepted
    pub connections_total: IntCounter,
    /// Current active client connections
    pub connections_active: IntGauge,

    /// Statements routed by target (master/slave/all)
    pub queries_routed_total: IntCounterVec,
    /// Routing errors by kind
    pub query_errors_total: IntCounterVec,

    /// Session commands broadcast
    pub session_commands_total: IntCounter,
    /// Reads retried on another replica
    pub read_retries_total: IntCounter,
    /// Keep-alive pings sent to idle backends
    pub keepalive_pings_total: IntCounter,
    /// Primary changes handled by sessions
    pub failovers_total: IntCounter,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let connections_total = IntCounter::new(
            "hermes_connections_total",
            "Total number of client connections accepted",
        )
        .unwrap();

        let connections_active = IntGauge::new(
            "hermes_connections_active",
            "Current number of active client connections",
        )
        .unwrap();

        let queries_routed_total = IntCounterVec::new(
            Opts::new(
                "hermes_queries_routed_total",
                "Statements routed by target",
            ),
            &["target"],
        )
        .unwrap();

        let query_errors_total = IntCounterVec::new(
            Opts::new("hermes_query_errors_total", "Routing errors by kind"),
            &["kind"],
        )
        .unwrap();

        let session_commands_total = IntCounter::new(
            "hermes_session_commands_total",
            "Session commands broadcast to all backends",
        )
        .unwrap();

        let read_retries_total = IntCounter::new(
            "hermes_read_retries_total",
            "Reads retried on another replica after a backend failure",
        )
        .unwrap();

        let keepalive_pings_total = IntCounter::new(
            "hermes_keepalive_pings_total",
            "Keep-alive pings sent to idle backends",
        )
        .unwrap();

        let failovers_total = IntCounter::new(
            "hermes_failovers_total",
            "Primary changes handled by sessions",
        )
        .unwrap();

        registry.register(Box::new(connections_total.clone())).unwrap();
        registry.register(Box::new(connections_active.clone())).unwrap();
        registry.register(Box::new(queries_routed_total.clone())).unwrap();
        registry.register(Box::new(query_errors_total.clone())).unwrap();
        registry.register(Box::new(session_commands_total.clone())).unwrap();
        registry.register(Box::new(read_retries_total.clone())).unwrap();
        registry.register(Box::new(keepalive_pings_total.clone())).unwrap();
        registry.register(Box::new(failovers_total.clone())).unwrap();

        Self {
            registry,
            connections_total,
            connections_active,
            queries_routed_total,
            query_errors_total,
            session_commands_total,
            read_retries_total,
            keepalive_pings_total,
            failovers_total,
        }
    }

    pub fn record_connection_accepted(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    pub fn record_connection_closed(&self) {
        self.connections_active.dec();
    }

    pub fn record_route(&self, target: &str) {
        self.queries_routed_total.with_label_values(&[target]).inc();
    }

    pub fn record_query_error(&self, kind: &str) {
        self.query_errors_total.with_label_values(&[kind]).inc();
    }

    pub fn record_session_command(&self) {
        self.session_commands_total.inc();
    }

    pub fn record_read_retry(&self) {
        self.read_retries_total.inc();
    }

    pub fn record_keepalive_ping(&self) {
        self.keepalive_pings_total.inc();
    }

    pub fn record_failover(&self) {
        self.failovers_total.inc();
    }

    /// Render all metrics in the Prometheus text format
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(addr: &str) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tracing::{error, info};

    async fn handle_request(
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        match req.uri().path() {
            "/metrics" => {
                let body = metrics().render();
                Ok(Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                    .body(Full::new(Bytes::from(body)))
                    .unwrap())
            }
            "/health" => Ok(Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from("OK")))
                .unwrap()),
            _ => Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("Not Found")))
                .unwrap()),
        }
    }

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!(error = %e, "Metrics server connection error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render() {
        let m = metrics();
        m.record_route("slave");
        m.record_session_command();

        let rendered = m.render();
        assert!(rendered.contains("hermes_queries_routed_total"));
        assert!(rendered.contains("hermes_session_commands_total"));
    }
}
