//! # Prometheus Metrics: Exposition for Container Orchestration
//!
//! Exposes switchboard operational metrics in the Prometheus text exposition
//! format for scraping by Prometheus, Grafana Agent, or any
//! OpenMetrics-compatible collector.
//!
//! ## Metrics Exposed
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `switchboard_webhooks_total` | Counter | `kind`, `outcome` | Provider callbacks received |
//! | `switchboard_call_transitions_total` | Counter | `status` | Applied call status transitions |
//! | `switchboard_transitions_ignored_total` | Counter | `reason` | Status reports that changed nothing |
//! | `switchboard_agents_online` | Gauge |: | Agents with at least one socket |
//! | `switchboard_agents_available` | Gauge |: | Agents `online` and not on a call |
//! | `switchboard_pending_calls` | Gauge |: | Incoming calls awaiting acceptance |
//! | `switchboard_socket_connections` | Gauge |: | Open hub connections |
//! | `switchboard_http_request_duration_seconds` | Histogram | `method`, `path` | Request latency |
//!
//! ## Integration
//!
//! Counters are bumped inline by the webhook handlers and the orchestrator.
//! Presence gauges are refreshed from the hub's snapshot channel. The
//! `/metrics` endpoint renders the current registry state on each scrape.

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WebhookLabel {
    pub kind: String,
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusLabel {
    pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReasonLabel {
    pub reason: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct KindLabel {
    pub kind: String,
}

/// Label set for HTTP request latency.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HttpLabel {
    pub method: String,
    pub path: String,
}

/// Thread-safe metrics registry.
///
/// All fields use atomic types and are safe to update from any thread or async task.
/// The `Family` type automatically creates per-label-set metric instances on first use.
pub struct Metrics {
    pub registry: Registry,
    pub webhooks: Family<WebhookLabel, Counter>,
    pub call_transitions: Family<StatusLabel, Counter>,
    pub transitions_ignored: Family<ReasonLabel, Counter>,
    pub notifications_dropped: Family<KindLabel, Counter>,
    pub agents_online: Gauge,
    pub agents_available: Gauge,
    pub pending_calls: Gauge,
    pub socket_connections: Gauge,
    pub http_request_duration: Family<HttpLabel, Histogram>,
}

impl Metrics {
    /// Create a new metrics registry with all switchboard metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let webhooks = Family::<WebhookLabel, Counter>::default();
        registry.register(
            "switchboard_webhooks",
            "Provider callbacks received by kind and outcome",
            webhooks.clone(),
        );

        let call_transitions = Family::<StatusLabel, Counter>::default();
        registry.register(
            "switchboard_call_transitions",
            "Applied call status transitions by target status",
            call_transitions.clone(),
        );

        let transitions_ignored = Family::<ReasonLabel, Counter>::default();
        registry.register(
            "switchboard_transitions_ignored",
            "Status reports ignored by the state machine",
            transitions_ignored.clone(),
        );

        let notifications_dropped = Family::<KindLabel, Counter>::default();
        registry.register(
            "switchboard_hub_notifications_dropped",
            "Call notifications the hub queue had no room for",
            notifications_dropped.clone(),
        );

        let agents_online = Gauge::default();
        registry.register(
            "switchboard_agents_online",
            "Agents with at least one open socket",
            agents_online.clone(),
        );

        let agents_available = Gauge::default();
        registry.register(
            "switchboard_agents_available",
            "Agents online and not on a call",
            agents_available.clone(),
        );

        let pending_calls = Gauge::default();
        registry.register(
            "switchboard_pending_calls",
            "Incoming calls awaiting acceptance",
            pending_calls.clone(),
        );

        let socket_connections = Gauge::default();
        registry.register(
            "switchboard_socket_connections",
            "Open presence hub connections",
            socket_connections.clone(),
        );

        let http_request_duration =
            Family::<HttpLabel, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.005, 2.0, 12))
            });
        registry.register(
            "switchboard_http_request_duration_seconds",
            "HTTP request latency",
            http_request_duration.clone(),
        );

        Self {
            registry,
            webhooks,
            call_transitions,
            transitions_ignored,
            notifications_dropped,
            agents_online,
            agents_available,
            pending_calls,
            socket_connections,
            http_request_duration,
        }
    }

    pub fn record_webhook(&self, kind: &str, outcome: &str) {
        self.webhooks
            .get_or_create(&WebhookLabel {
                kind: kind.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
    }

    pub fn record_transition(&self, status: &str) {
        self.call_transitions
            .get_or_create(&StatusLabel {
                status: status.to_string(),
            })
            .inc();
    }

    pub fn record_ignored(&self, reason: &str) {
        self.transitions_ignored
            .get_or_create(&ReasonLabel {
                reason: reason.to_string(),
            })
            .inc();
    }

    pub fn record_notification_dropped(&self, kind: &str) {
        self.notifications_dropped
            .get_or_create(&KindLabel {
                kind: kind.to_string(),
            })
            .inc();
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        if let Err(e) = encode(&mut buf, &self.registry) {
            tracing::error!(error = %e, "metrics encoding failed");
        }
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
