//! Process-wide gateway counters, exported in Prometheus text format via the
//! monitor listener.

use log::warn;
use prometheus::{IntCounter, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

pub struct GatewayMetrics {
    pub connections_accepted: IntCounter,
    pub handshake_failures: IntCounter,
    pub parse_failures: IntCounter,
    pub backend_failures: IntCounter,
    pub requests_forwarded: IntCounter,
    pub response_bytes: IntCounter,
}

impl GatewayMetrics {
    fn new() -> Self {
        fn counter(name: &str, help: &str) -> IntCounter {
            IntCounter::with_opts(Opts::new(name, help).namespace("tollgate"))
                .expect("gateway counter")
        }
        Self {
            connections_accepted: counter(
                "connections_accepted_total",
                "TCP connections accepted by the gateway listener",
            ),
            handshake_failures: counter(
                "tls_handshake_failures_total",
                "Connections dropped during the TLS handshake",
            ),
            parse_failures: counter(
                "request_parse_failures_total",
                "Connections closed because the request head failed to parse",
            ),
            backend_failures: counter(
                "backend_failures_total",
                "Forwarding attempts that failed to reach the backend",
            ),
            requests_forwarded: counter(
                "requests_forwarded_total",
                "Requests forwarded to the backend with a relayed response",
            ),
            response_bytes: counter(
                "response_bytes_relayed_total",
                "Response body bytes relayed back to clients",
            ),
        }
    }

    fn register(&self, registry: &Registry) {
        let collectors: [Box<dyn prometheus::core::Collector>; 6] = [
            Box::new(self.connections_accepted.clone()),
            Box::new(self.handshake_failures.clone()),
            Box::new(self.parse_failures.clone()),
            Box::new(self.backend_failures.clone()),
            Box::new(self.requests_forwarded.clone()),
            Box::new(self.response_bytes.clone()),
        ];
        for collector in collectors {
            if let Err(err) = registry.register(collector) {
                warn!("Failed to register gateway metric: {}", err);
            }
        }
    }
}

pub fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

pub fn metrics() -> &'static GatewayMetrics {
    static METRICS: OnceLock<GatewayMetrics> = OnceLock::new();
    METRICS.get_or_init(|| {
        let m = GatewayMetrics::new();
        m.register(registry());
        crate::trust::register_trust_metrics(registry());
        m
    })
}

/// Renders every registered collector in Prometheus text exposition format.
pub fn encode() -> Result<String, prometheus::Error> {
    metrics(); // make sure collectors are registered before the first scrape
    let encoder = TextEncoder::new();
    encoder.encode_to_string(&registry().gather())
}
