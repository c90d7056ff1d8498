use std::sync::LazyLock;

use prometheus::proto::MetricFamily;
use prometheus::{
    register_gauge_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_with_registry, Encoder, Gauge, IntCounterVec, IntGauge, Registry,
};

/// The exporter's own health metrics, served after the ruleset snapshot.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static REFRESH_COUNTER: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "nftables_exporter_refresh_total",
        "Number of ruleset refresh cycles by result",
        &["result"],
        &REGISTRY
    )
    .unwrap()
});

pub static LAST_REFRESH_SUCCESS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge_with_registry!(
        "nftables_exporter_last_refresh_success_timestamp_seconds",
        "Unix time of the last successful refresh",
        &REGISTRY
    )
    .unwrap()
});

pub static REFRESH_DURATION: LazyLock<Gauge> = LazyLock::new(|| {
    register_gauge_with_registry!(
        "nftables_exporter_refresh_duration_seconds",
        "Duration of the last successful refresh",
        &REGISTRY
    )
    .unwrap()
});

pub static GEOIP_CACHE_ENTRIES: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge_with_registry!(
        "nftables_exporter_geoip_cache_entries",
        "Number of addresses held in the GeoIP lookup cache",
        &REGISTRY
    )
    .unwrap()
});

pub fn encode() -> String {
    encode_families(&REGISTRY.gather())
}

/// Text exposition of `families`, empty on encoder failure.
pub fn encode_families(families: &[MetricFamily]) -> String {
    let encoder = prometheus::TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(families, &mut buffer) {
        tracing::error!(msg = "Could not encode metrics", ?err);
        return String::default();
    };
    String::from_utf8(buffer).unwrap_or_else(|err| {
        tracing::error!(msg = "Encoded metrics are not utf8", ?err);
        String::default()
    })
}
