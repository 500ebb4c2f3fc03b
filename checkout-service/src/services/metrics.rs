//! Prometheus metrics for checkout-service.
//!
//! HTTP request metrics come from the `metrics` recorder installed here;
//! domain counters are `prometheus` statics on the default registry. Both
//! are rendered together by [`get_metrics`].

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

static METRICS_HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "checkout_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Webhook deliveries by provider and outcome.
pub static WEBHOOK_OUTCOMES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "checkout_webhook_outcomes_total",
            "Webhook deliveries by provider and outcome"
        ),
        &["provider", "outcome"]
    )
    .expect("Failed to register WEBHOOK_OUTCOMES_TOTAL")
});

pub static SIGNATURE_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "checkout_signature_failures_total",
            "Webhook signature failures by provider and policy"
        ),
        &["provider", "policy"]
    )
    .expect("Failed to register SIGNATURE_FAILURES_TOTAL")
});

pub static SECURITY_ALERTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("checkout_security_alerts_total", "Security alerts by kind"),
        &["kind"]
    )
    .expect("Failed to register SECURITY_ALERTS_TOTAL")
});

pub static RESOLVER_MATCHES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "checkout_resolver_matches_total",
            "Order lookups by provider and matching strategy"
        ),
        &["provider", "strategy"]
    )
    .expect("Failed to register RESOLVER_MATCHES_TOTAL")
});

pub static COMMISSIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "checkout_commissions_total",
            "Commissions created by initial status"
        ),
        &["status"]
    )
    .expect("Failed to register COMMISSIONS_TOTAL")
});

pub static PAYOUTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "checkout_payouts_total",
            "Affiliate transfer attempts by trigger and result"
        ),
        &["trigger", "result"]
    )
    .expect("Failed to register PAYOUTS_TOTAL")
});

pub static SIDE_EFFECTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "checkout_side_effects_total",
            "Queued side effects by kind and result"
        ),
        &["kind", "result"]
    )
    .expect("Failed to register SIDE_EFFECTS_TOTAL")
});

/// Install the HTTP metrics recorder and register domain metrics.
///
/// Safe to call more than once; only the first call installs anything.
pub fn init_metrics() {
    METRICS_HANDLE.get_or_init(|| PrometheusBuilder::new().install_recorder().ok());

    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&WEBHOOK_OUTCOMES_TOTAL);
    Lazy::force(&SIGNATURE_FAILURES_TOTAL);
    Lazy::force(&SECURITY_ALERTS_TOTAL);
    Lazy::force(&RESOLVER_MATCHES_TOTAL);
    Lazy::force(&COMMISSIONS_TOTAL);
    Lazy::force(&PAYOUTS_TOTAL);
    Lazy::force(&SIDE_EFFECTS_TOTAL);
}

pub fn get_metrics() -> String {
    let mut output = METRICS_HANDLE
        .get()
        .and_then(|handle| handle.as_ref())
        .map(|handle| handle.render())
        .unwrap_or_default();

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buffer).is_ok()
        && let Ok(domain) = String::from_utf8(buffer)
    {
        output.push_str(&domain);
    }

    output
}

pub fn record_webhook_outcome(provider: &str, outcome: &str) {
    WEBHOOK_OUTCOMES_TOTAL
        .with_label_values(&[provider, outcome])
        .inc();
}

pub fn record_signature_failure(provider: &str, policy: &str) {
    SIGNATURE_FAILURES_TOTAL
        .with_label_values(&[provider, policy])
        .inc();
}

pub fn record_security_alert(kind: &str) {
    SECURITY_ALERTS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_resolver_match(provider: &str, strategy: &str) {
    RESOLVER_MATCHES_TOTAL
        .with_label_values(&[provider, strategy])
        .inc();
}

pub fn record_commission(status: &str) {
    COMMISSIONS_TOTAL.with_label_values(&[status]).inc();
}

pub fn record_payout(trigger: &str, result: &str) {
    PAYOUTS_TOTAL.with_label_values(&[trigger, result]).inc();
}

pub fn record_side_effect(kind: &str, result: &str) {
    SIDE_EFFECTS_TOTAL.with_label_values(&[kind, result]).inc();
}
