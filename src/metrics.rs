//! Prometheus metrics collection for the collaboration backend
//!
//! All metrics are exposed via the /metrics endpoint for Prometheus scraping.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::convert::Infallible;
use std::sync::Arc;

/// Global metrics registry for the application
pub static REGISTRY: once_cell::sync::Lazy<Arc<Registry>> =
    once_cell::sync::Lazy::new(|| Arc::new(Registry::new()));

/// Application-level metrics
pub struct AppMetrics {
    /// WebSocket connections opened over the process lifetime
    pub connections_total: IntCounter,

    /// Currently open WebSocket connections
    pub connections_active: IntGauge,

    /// Inbound events by name
    pub events_total: IntCounterVec,

    /// Event handler latency
    pub event_duration_seconds: HistogramVec,

    /// Frames fanned out to room members, by event name
    pub broadcasts_total: IntCounterVec,

    /// Operational transforms performed
    pub transforms_total: IntCounter,

    /// Conflicts detected by type
    pub conflicts_total: IntCounterVec,

    /// Notifications dispatched by category
    pub notifications_total: IntCounterVec,

    /// Messages waiting in durable queues
    pub queue_depth: IntGauge,

    /// Errors surfaced to clients, by wire code
    pub errors_total: IntCounterVec,

    /// Application uptime
    pub app_uptime_seconds: IntCounter,
}

impl AppMetrics {
    /// Create and register all metrics
    pub fn new() -> anyhow::Result<Self> {
        let registry = &*REGISTRY;

        let connections_total = IntCounter::new(
            "ws_connections_total",
            "Total number of WebSocket connections accepted",
        )?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = IntGauge::new(
            "ws_connections_active",
            "Number of currently open WebSocket connections",
        )?;
        registry.register(Box::new(connections_active.clone()))?;

        let events_total = IntCounterVec::new(
            Opts::new("ws_events_total", "Inbound events by name"),
            &["event"],
        )?;
        registry.register(Box::new(events_total.clone()))?;

        let event_duration_seconds = HistogramVec::new(
            HistogramOpts::new("ws_event_duration_seconds", "Event handler latency"),
            &["event"],
        )?;
        registry.register(Box::new(event_duration_seconds.clone()))?;

        let broadcasts_total = IntCounterVec::new(
            Opts::new("ws_broadcasts_total", "Frames fanned out to room members"),
            &["event"],
        )?;
        registry.register(Box::new(broadcasts_total.clone()))?;

        let transforms_total = IntCounter::new(
            "ot_transforms_total",
            "Operational transforms performed",
        )?;
        registry.register(Box::new(transforms_total.clone()))?;

        let conflicts_total = IntCounterVec::new(
            Opts::new("annotation_conflicts_total", "Conflicts detected by type"),
            &["type"],
        )?;
        registry.register(Box::new(conflicts_total.clone()))?;

        let notifications_total = IntCounterVec::new(
            Opts::new(
                "notifications_total",
                "Notifications dispatched by category",
            ),
            &["category"],
        )?;
        registry.register(Box::new(notifications_total.clone()))?;

        let queue_depth = IntGauge::new(
            "message_queue_depth",
            "Messages waiting in durable queues",
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        let errors_total = IntCounterVec::new(
            Opts::new("errors_total", "Errors surfaced to clients by wire code"),
            &["code"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let app_uptime_seconds =
            IntCounter::new("app_uptime_seconds", "Application uptime in seconds")?;
        registry.register(Box::new(app_uptime_seconds.clone()))?;

        Ok(Self {
            connections_total,
            connections_active,
            events_total,
            event_duration_seconds,
            broadcasts_total,
            transforms_total,
            conflicts_total,
            notifications_total,
            queue_depth,
            errors_total,
            app_uptime_seconds,
        })
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<AppMetrics> = once_cell::sync::Lazy::new(|| {
    AppMetrics::new().expect("failed to register application metrics")
});

pub fn record_connection_opened() {
    METRICS.connections_total.inc();
    METRICS.connections_active.inc();
}

pub fn record_connection_closed() {
    METRICS.connections_active.dec();
}

pub fn record_event(event: &str) {
    METRICS.events_total.with_label_values(&[event]).inc();
}

pub fn record_event_duration(event: &str, seconds: f64) {
    METRICS
        .event_duration_seconds
        .with_label_values(&[event])
        .observe(seconds);
}

pub fn record_broadcast(event: &str) {
    METRICS.broadcasts_total.with_label_values(&[event]).inc();
}

pub fn record_transform() {
    METRICS.transforms_total.inc();
}

pub fn record_conflict(conflict_type: &str) {
    METRICS
        .conflicts_total
        .with_label_values(&[conflict_type])
        .inc();
}

pub fn record_notification(category: &str) {
    METRICS
        .notifications_total
        .with_label_values(&[category])
        .inc();
}

pub fn record_queue_depth(depth: usize) {
    METRICS.queue_depth.set(depth as i64);
}

pub fn record_error(code: &str) {
    METRICS.errors_total.with_label_values(&[code]).inc();
}

pub fn increment_uptime(seconds: u64) {
    METRICS.app_uptime_seconds.inc_by(seconds);
}

/// Prometheus text exposition for the /metrics endpoint
pub async fn metrics_handler() -> Result<impl warp::Reply, Infallible> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::error!("metrics encoding failed: {}", e);
    }
    Ok(warp::reply::with_header(
        buffer,
        "content-type",
        encoder.format_type().to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_record() {
        // REQUIREMENT: /metrics exposes detailed counters in Prometheus format
        // PURPOSE: Verify the registry wires up and counters move

        record_event("join-project");
        record_event("join-project");
        record_broadcast("annotation-created");
        record_transform();
        record_conflict("label-conflict");
        record_error("RATE_LIMIT_ERROR");
        record_queue_depth(7);

        let families = REGISTRY.gather();
        assert!(!families.is_empty());

        let events = families
            .iter()
            .find(|f| f.name() == "ws_events_total")
            .expect("events metric registered");
        let count: u64 = events
            .get_metric()
            .iter()
            .map(|m| m.get_counter().value() as u64)
            .sum();
        assert!(count >= 2);
    }
}
