//! Prometheus metrics for the LMTP listeners and delivery

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Metric handles plus the registry that exports them
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Accepted connections by listener (`async`, `blocking`)
    pub connections: IntCounterVec,
    pub active_connections: IntGauge,
    /// Connections refused because the listener was full
    pub rejected_connections: IntCounter,
    pub messages_received: IntCounter,
    pub bytes_received: IntCounter,
    /// Per-recipient outcomes (`delivered`, `duplicate`, `discarded`,
    /// `deferred`, `failed`)
    pub recipients: IntCounterVec,
    /// Remote group deliveries by result (`ok`, `failed`)
    pub remote_deliveries: IntCounterVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("postbox".to_string()), None)?;

        let connections = IntCounterVec::new(
            Opts::new("lmtp_connections_total", "LMTP connections accepted"),
            &["listener"],
        )?;
        let active_connections =
            IntGauge::new("lmtp_active_connections", "LMTP connections currently open")?;
        let rejected_connections = IntCounter::new(
            "lmtp_rejected_connections_total",
            "LMTP connections refused at the connection limit",
        )?;
        let messages_received =
            IntCounter::new("lmtp_messages_received_total", "DATA payloads received")?;
        let bytes_received =
            IntCounter::new("lmtp_bytes_received_total", "DATA payload bytes received")?;
        let recipients = IntCounterVec::new(
            Opts::new("delivery_recipients_total", "Per-recipient delivery outcomes"),
            &["outcome"],
        )?;
        let remote_deliveries = IntCounterVec::new(
            Opts::new("delivery_remote_total", "Remote node deliveries"),
            &["result"],
        )?;

        registry.register(Box::new(connections.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(rejected_connections.clone()))?;
        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(bytes_received.clone()))?;
        registry.register(Box::new(recipients.clone()))?;
        registry.register(Box::new(remote_deliveries.clone()))?;

        Ok(Self {
            registry,
            connections,
            active_connections,
            rejected_connections,
            messages_received,
            bytes_received,
            recipients,
            remote_deliveries,
        })
    }

    pub fn recipient(&self, outcome: &str) {
        self.recipients.with_label_values(&[outcome]).inc();
    }

    /// Text exposition format
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.connections.with_label_values(&["async"]).inc();
        metrics.recipient("delivered");
        metrics.recipient("delivered");

        let text = metrics.render();
        assert!(text.contains("postbox_lmtp_connections_total{listener=\"async\"} 1"));
        assert!(text.contains("postbox_delivery_recipients_total{outcome=\"delivered\"} 2"));
    }
}
