//! Ingestion metrics
//!
//! Counters and gauges recorded through the `metrics` facade. Without an
//! installed recorder every call is a no-op; with the `prometheus` feature
//! [`init_metrics_exporter`] installs the Prometheus exporter.
//!
//! # Metrics
//!
//! - `ingestion_messages_total`: Counter of consumed messages by topic
//! - `ingestion_messages_dropped_total`: Counter of dropped messages by reason
//! - `ingestion_downstream_requests_total`: Counter of downstream requests by service and outcome
//! - `ingestion_downstream_duration_seconds`: Histogram of downstream request latency by service
//! - `ingestion_subscription_errors_total`: Counter of subscription errors by topic
//! - `ingestion_open_subscriptions`: Gauge of subscriptions not yet closed
//!
//! # Examples
//!
//! ```
//! use iot_ingestion::metrics::SubscriptionGauge;
//!
//! let gauge = SubscriptionGauge::open("iot-dev-acme-raw-data");
//! assert_eq!(gauge.topic(), "iot-dev-acme-raw-data");
//! gauge.close();
//! ```

use metrics::{decrement_gauge, histogram, increment_counter, increment_gauge};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Records a message delivered by a subscription.
pub fn record_message(topic: &str) {
    increment_counter!("ingestion_messages_total", "topic" => topic.to_string());
}

/// Records a message dropped before any write, with the error kind as reason.
pub fn record_dropped(reason: &'static str) {
    increment_counter!("ingestion_messages_dropped_total", "reason" => reason);
}

/// Records one downstream request attempt.
pub fn record_downstream_request(service: &'static str, outcome: &'static str, elapsed: Duration) {
    increment_counter!(
        "ingestion_downstream_requests_total",
        "service" => service,
        "outcome" => outcome
    );
    histogram!(
        "ingestion_downstream_duration_seconds",
        elapsed.as_secs_f64(),
        "service" => service
    );
}

/// Records a transport or session error surfaced by a subscription.
pub fn record_subscription_error(topic: &str) {
    increment_counter!("ingestion_subscription_errors_total", "topic" => topic.to_string());
}

/// Keeps `ingestion_open_subscriptions` in step with a subscription's life.
///
/// The gauge is incremented on open and decremented exactly once, either
/// by [`SubscriptionGauge::close`] or on drop.
#[derive(Debug)]
pub struct SubscriptionGauge {
    topic: String,
    closed: AtomicBool,
}

impl SubscriptionGauge {
    /// Increments the open-subscriptions gauge.
    pub fn open(topic: &str) -> Self {
        increment_gauge!("ingestion_open_subscriptions", 1.0);
        Self {
            topic: topic.to_string(),
            closed: AtomicBool::new(false),
        }
    }

    /// Decrements the gauge; later calls are ignored.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            decrement_gauge!("ingestion_open_subscriptions", 1.0);
        }
    }

    /// Topic of the tracked subscription.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Whether the gauge has already been decremented.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for SubscriptionGauge {
    fn drop(&mut self) {
        self.close();
    }
}

/// Initializes the metrics exporter for Prometheus
///
/// With the `prometheus` feature the exporter listens on its default
/// address. Otherwise this is a no-op and safe to call.
pub fn init_metrics_exporter() {
    #[cfg(feature = "prometheus")]
    {
        use metrics_exporter_prometheus::PrometheusBuilder;
        let builder = PrometheusBuilder::new();
        let _ = builder.install().map_err(|e| {
            tracing::warn!("Failed to install Prometheus exporter: {}", e);
        });
    }
}
