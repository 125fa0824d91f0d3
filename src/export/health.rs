use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for agent health and observability.
///
/// All metrics use the "tcpagg" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Input lines read by kind and outcome (parsed/rejected).
    pub lines_read: CounterVec,
    /// Parse failures by kind and error_type.
    pub parse_errors: CounterVec,
    /// Events dropped because they came from the agent itself.
    pub self_traffic_filtered: Counter,
    /// Summaries dropped because a queue was full.
    pub queue_drops: Counter,
    /// Distinct processes in the local aggregator.
    pub processes_tracked: Gauge,
    /// Completed gather exchanges.
    pub gather_cycles: Counter,
    /// Wall time of one gather exchange.
    pub gather_duration: Histogram,
    /// Summaries written to the output sink.
    pub summaries_emitted: Counter,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let lines_read = CounterVec::new(
            Opts::new("lines_read_total", "Input lines read by kind and outcome.")
                .namespace("tcpagg"),
            &["kind", "outcome"],
        )?;
        let parse_errors = CounterVec::new(
            Opts::new("parse_errors_total", "Line parse failures by kind and error type.")
                .namespace("tcpagg"),
            &["kind", "error_type"],
        )?;
        let self_traffic_filtered = Counter::with_opts(
            Opts::new(
                "self_traffic_filtered_total",
                "Events discarded because they were emitted by the agent itself.",
            )
            .namespace("tcpagg"),
        )?;
        let queue_drops = Counter::with_opts(
            Opts::new(
                "queue_drops_total",
                "Summaries dropped because the queue was full.",
            )
            .namespace("tcpagg"),
        )?;
        let processes_tracked = Gauge::with_opts(
            Opts::new(
                "processes_tracked",
                "Distinct processes in the local aggregator.",
            )
            .namespace("tcpagg"),
        )?;
        let gather_cycles = Counter::with_opts(
            Opts::new("gather_cycles_total", "Completed gather exchanges.").namespace("tcpagg"),
        )?;
        let gather_duration = Histogram::with_opts(
            HistogramOpts::new(
                "gather_duration_seconds",
                "Wall time of one gather exchange.",
            )
            .namespace("tcpagg")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        let summaries_emitted = Counter::with_opts(
            Opts::new(
                "summaries_emitted_total",
                "Merged summaries written to the output sink.",
            )
            .namespace("tcpagg"),
        )?;

        registry.register(Box::new(lines_read.clone()))?;
        registry.register(Box::new(parse_errors.clone()))?;
        registry.register(Box::new(self_traffic_filtered.clone()))?;
        registry.register(Box::new(queue_drops.clone()))?;
        registry.register(Box::new(processes_tracked.clone()))?;
        registry.register(Box::new(gather_cycles.clone()))?;
        registry.register(Box::new(gather_duration.clone()))?;
        registry.register(Box::new(summaries_emitted.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            lines_read,
            parse_errors,
            self_traffic_filtered,
            queue_drops,
            processes_tracked,
            gather_cycles,
            gather_duration,
            summaries_emitted,
        })
    }

    /// Renders every registered metric in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        // ":port" binds every interface.
        let bind_addr = match self.addr.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{port}"),
            None => self.addr.clone(),
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .context("encoding metrics")?;

    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_namespaced() {
        let metrics = HealthMetrics::new(":0").unwrap();
        metrics
            .lines_read
            .with_label_values(&["life", "parsed"])
            .inc_by(3.0);
        metrics
            .parse_errors
            .with_label_values(&["connect", "missing_token"])
            .inc();
        metrics.processes_tracked.set(2.0);

        let text = metrics.render().unwrap();
        assert!(text.contains("tcpagg_lines_read_total{kind=\"life\",outcome=\"parsed\"} 3"));
        assert!(text.contains("tcpagg_parse_errors_total"));
        assert!(text.contains("tcpagg_processes_tracked 2"));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let metrics = HealthMetrics::new("127.0.0.1:0").unwrap();
        metrics.start().await.unwrap();
        metrics.stop().await.unwrap();
        // Stopping twice is harmless.
        metrics.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_port_shorthand_binds_all_interfaces() {
        let metrics = HealthMetrics::new(":0").unwrap();
        metrics.start().await.unwrap();
        metrics.stop().await.unwrap();
    }
}
