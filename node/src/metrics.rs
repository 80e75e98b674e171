//! # Prometheus Metrics
//!
//! Exposes operational metrics for the ledger node. Scraped by Prometheus
//! at the `/metrics` HTTP endpoint on the configured metrics port.
//!
//! All metrics are registered in a dedicated [`prometheus::Registry`] so they
//! do not collide with any default global registry consumers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Holds all Prometheus metric handles for the node.
///
/// Clone-friendly (prometheus handles are reference counted) so it can be
/// shared across request handlers.
#[derive(Clone)]
pub struct NodeMetrics {
    /// Prometheus registry that owns all metrics below.
    registry: Registry,
    /// Ledger commands handled, by command and outcome (`ok` or the
    /// condition name).
    pub commands_total: IntCounterVec,
    /// Events committed to the log.
    pub events_committed_total: IntCounter,
    /// Registered users.
    pub registered_users: IntGauge,
    /// Open WebSocket subscriptions.
    pub ws_subscribers: IntGauge,
    /// Time spent handling a JSON-RPC call.
    pub rpc_latency_seconds: Histogram,
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("bitsave".into()), None)?;

        let commands_total = IntCounterVec::new(
            Opts::new("commands_total", "Ledger commands handled"),
            &["command", "outcome"],
        )?;
        registry.register(Box::new(commands_total.clone()))?;

        let events_committed_total =
            IntCounter::new("events_committed_total", "Events committed to the log")?;
        registry.register(Box::new(events_committed_total.clone()))?;

        let registered_users = IntGauge::new("registered_users", "Number of registered users")?;
        registry.register(Box::new(registered_users.clone()))?;

        let ws_subscribers = IntGauge::new("ws_subscribers", "Open WebSocket subscriptions")?;
        registry.register(Box::new(ws_subscribers.clone()))?;

        let rpc_latency_seconds = Histogram::with_opts(
            HistogramOpts::new("rpc_latency_seconds", "JSON-RPC handling latency in seconds")
                .buckets(vec![
                    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
                ]),
        )?;
        registry.register(Box::new(rpc_latency_seconds.clone()))?;

        Ok(Self {
            registry,
            commands_total,
            events_committed_total,
            registered_users,
            ws_subscribers,
            rpc_latency_seconds,
        })
    }

    /// Records one handled command.
    pub fn record_command(&self, command: &str, outcome: &str) {
        self.commands_total
            .with_label_values(&[command, outcome])
            .inc();
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Shared metrics state passed to axum handlers.
pub type SharedMetrics = Arc<NodeMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(State(metrics): State<SharedMetrics>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
