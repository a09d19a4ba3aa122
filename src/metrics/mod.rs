//! Prometheus metrics for the Mariner proxy
//!
//! Exposes metrics via HTTP endpoint for Prometheus scraping.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use std::sync::OnceLock;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Mariner metrics collection
pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    // Connection metrics
    /// Total client connections accepted
    pub connections_total: IntCounter,
    /// Current active client connections
    pub connections_active: IntGauge,
    /// Total client connections closed
    pub connections_closed: IntCounter,
    /// Failed client authentications by reason
    pub auth_failures_total: IntCounterVec,

    // Query metrics
    /// Total statements processed by command
    pub queries_total: IntCounterVec,
    /// Statement latency histogram (in seconds)
    pub query_duration_seconds: HistogramVec,
    /// Errors sent to clients by type
    pub query_errors_total: IntCounterVec,

    // Pool metrics
    /// Backend connection permits acquired
    pub pool_acquired_total: IntCounterVec,
    /// Pool rejections (queue full)
    pub pool_rejected_queue_full: IntCounterVec,
    /// Pool rejections (timeout)
    pub pool_rejected_timeout: IntCounterVec,
    /// Open backend connections by server
    pub backend_connections: IntGaugeVec,

    // Routing metrics
    /// Statements routed by target (primary/replica/all)
    pub queries_routed_total: IntCounterVec,
    /// Statements fanned out to every backend
    pub fanout_queries_total: IntCounter,
    /// Transaction replays by outcome
    pub trx_replays_total: IntCounterVec,
    /// KILL commands executed by kind
    pub kills_total: IntCounterVec,
}

impl Metrics {
    /// Create a new metrics collection
    pub fn new() -> Self {
        let registry = Registry::new();

        // Connection metrics
        let connections_total = IntCounter::new(
            "mariner_connections_total",
            "Total number of client connections accepted",
        )
        .unwrap();

        let connections_active = IntGauge::new(
            "mariner_connections_active",
            "Current number of active client connections",
        )
        .unwrap();

        let connections_closed = IntCounter::new(
            "mariner_connections_closed_total",
            "Total number of client connections closed",
        )
        .unwrap();

        let auth_failures_total = IntCounterVec::new(
            Opts::new(
                "mariner_auth_failures_total",
                "Total number of failed client authentications",
            ),
            &["reason"], // wrong_password, unknown_plugin, db_access, error
        )
        .unwrap();

        // Query metrics
        let queries_total = IntCounterVec::new(
            Opts::new("mariner_queries_total", "Total number of statements processed"),
            &["command"],
        )
        .unwrap();

        let query_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "mariner_query_duration_seconds",
                "Statement latency in seconds",
            )
            .buckets(vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
                10.0,
            ]),
            &["router"],
        )
        .unwrap();

        let query_errors_total = IntCounterVec::new(
            Opts::new("mariner_query_errors_total", "Total number of errors sent to clients"),
            &["type"], // route, backend, pool, protocol
        )
        .unwrap();

        // Pool metrics
        let pool_acquired_total = IntCounterVec::new(
            Opts::new(
                "mariner_pool_acquired_total",
                "Total number of backend connection permits acquired",
            ),
            &["server"],
        )
        .unwrap();

        let pool_rejected_queue_full = IntCounterVec::new(
            Opts::new(
                "mariner_pool_rejected_queue_full_total",
                "Total number of backend connection requests rejected due to queue full",
            ),
            &["server"],
        )
        .unwrap();

        let pool_rejected_timeout = IntCounterVec::new(
            Opts::new(
                "mariner_pool_rejected_timeout_total",
                "Total number of backend connection requests rejected due to timeout",
            ),
            &["server"],
        )
        .unwrap();

        let backend_connections = IntGaugeVec::new(
            Opts::new(
                "mariner_backend_connections",
                "Current number of open backend connections",
            ),
            &["server"],
        )
        .unwrap();

        // Routing metrics
        let queries_routed_total = IntCounterVec::new(
            Opts::new(
                "mariner_queries_routed_total",
                "Total number of statements routed by target",
            ),
            &["target"], // primary/replica/all
        )
        .unwrap();

        let fanout_queries_total = IntCounter::new(
            "mariner_fanout_queries_total",
            "Total number of statements sent to every backend",
        )
        .unwrap();

        let trx_replays_total = IntCounterVec::new(
            Opts::new(
                "mariner_trx_replays_total",
                "Total number of transaction replays by outcome",
            ),
            &["outcome"], // success, mismatch, ineligible
        )
        .unwrap();

        let kills_total = IntCounterVec::new(
            Opts::new("mariner_kills_total", "Total number of KILL commands executed"),
            &["kind"], // connection, query
        )
        .unwrap();

        // Register all metrics
        registry
            .register(Box::new(connections_total.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_active.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_closed.clone()))
            .unwrap();
        registry
            .register(Box::new(auth_failures_total.clone()))
            .unwrap();
        registry
            .register(Box::new(queries_total.clone()))
            .unwrap();
        registry
            .register(Box::new(query_duration_seconds.clone()))
            .unwrap();
        registry
            .register(Box::new(query_errors_total.clone()))
            .unwrap();
        registry
            .register(Box::new(pool_acquired_total.clone()))
            .unwrap();
        registry
            .register(Box::new(pool_rejected_queue_full.clone()))
            .unwrap();
        registry
            .register(Box::new(pool_rejected_timeout.clone()))
            .unwrap();
        registry
            .register(Box::new(backend_connections.clone()))
            .unwrap();
        registry
            .register(Box::new(queries_routed_total.clone()))
            .unwrap();
        registry
            .register(Box::new(fanout_queries_total.clone()))
            .unwrap();
        registry
            .register(Box::new(trx_replays_total.clone()))
            .unwrap();
        registry
            .register(Box::new(kills_total.clone()))
            .unwrap();

        Self {
            registry,
            connections_total,
            connections_active,
            connections_closed,
            auth_failures_total,
            queries_total,
            query_duration_seconds,
            query_errors_total,
            pool_acquired_total,
            pool_rejected_queue_full,
            pool_rejected_timeout,
            backend_connections,
            queries_routed_total,
            fanout_queries_total,
            trx_replays_total,
            kills_total,
        }
    }

    /// Record a completed statement
    pub fn record_query(&self, command: &str, router: &str, duration_secs: f64) {
        self.queries_total.with_label_values(&[command]).inc();
        self.query_duration_seconds
            .with_label_values(&[router])
            .observe(duration_secs);
    }

    /// Record an error sent to a client
    pub fn record_query_error(&self, error_type: &str) {
        self.query_errors_total
            .with_label_values(&[error_type])
            .inc();
    }

    /// Record a new connection
    pub fn record_connection_accepted(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    /// Record a connection closed
    pub fn record_connection_closed(&self) {
        self.connections_active.dec();
        self.connections_closed.inc();
    }

    pub fn record_auth_failure(&self, reason: &str) {
        self.auth_failures_total.with_label_values(&[reason]).inc();
    }

    /// Record route decision
    pub fn record_route(&self, target: &str) {
        self.queries_routed_total.with_label_values(&[target]).inc();
    }

    pub fn record_fanout(&self) {
        self.fanout_queries_total.inc();
        self.queries_routed_total.with_label_values(&["all"]).inc();
    }

    pub fn record_replay(&self, outcome: &str) {
        self.trx_replays_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_kill(&self, kind: &str) {
        self.kills_total.with_label_values(&[kind]).inc();
    }

    /// Record pool permit acquired
    pub fn record_pool_acquired(&self, server: &str) {
        self.pool_acquired_total.with_label_values(&[server]).inc();
    }

    /// Record pool rejection (queue full)
    pub fn record_pool_queue_full(&self, server: &str) {
        self.pool_rejected_queue_full
            .with_label_values(&[server])
            .inc();
    }

    /// Record pool rejection (timeout)
    pub fn record_pool_timeout(&self, server: &str) {
        self.pool_rejected_timeout
            .with_label_values(&[server])
            .inc();
    }

    pub fn backend_connected(&self, server: &str) {
        self.backend_connections.with_label_values(&[server]).inc();
    }

    pub fn backend_disconnected(&self, server: &str) {
        self.backend_connections.with_label_values(&[server]).dec();
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(addr: &str) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tracing::{error, info};

    fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
        let mut resp = Response::new(Full::new(body.into()));
        *resp.status_mut() = status;
        resp
    }

    async fn handle_request(
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        match req.uri().path() {
            "/metrics" => {
                let mut resp = response(StatusCode::OK, metrics().gather());
                resp.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
                );
                Ok(resp)
            }
            "/health" => Ok(response(StatusCode::OK, "OK")),
            _ => Ok(response(StatusCode::NOT_FOUND, "Not Found")),
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
