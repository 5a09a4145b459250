//! Prometheus metrics.
//!
//! SECURITY: when the /metrics endpoint is enabled it must be
//! network-restricted to authorized scraper IPs at the infrastructure level.

use prometheus::{register_int_counter, register_int_gauge, IntCounter, IntGauge, TextEncoder};
use std::sync::LazyLock;

pub static ACTIVE_DOWNLOADS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("gantry_active_downloads", "In-flight download workers")
        .expect("metric registration cannot fail")
});

pub static TUNNEL_SESSIONS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("gantry_tunnel_sessions", "Open tunnel sessions")
        .expect("metric registration cannot fail")
});

pub static JANITOR_PURGED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "gantry_janitor_purged_total",
        "Tasks and blobs removed by the janitor"
    )
    .expect("metric registration cannot fail")
});

/// `GET /metrics`
pub async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    encoder
        .encode_to_string(&prometheus::gather())
        .unwrap_or_default()
}
