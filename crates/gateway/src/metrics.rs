use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static VIEWS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static VIEWS_MARKED_UNAPPLIED_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static RATINGS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static STORAGE_CONFLICT_RETRIES_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static LOGIN_CHECKS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "engage_gateway_http_requests_total",
                    "Gateway HTTP request count.",
                ),
                &["route", "method", "status"],
            )
            .expect("create engage_gateway_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "engage_gateway_http_request_duration_seconds",
                    "Gateway HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create engage_gateway_http_request_duration_seconds"),
        )
    })
}

fn views_total() -> &'static IntCounterVec {
    VIEWS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new("engage_gateway_views_total", "View signals by outcome."),
                &["outcome"],
            )
            .expect("create engage_gateway_views_total"),
        )
    })
}

fn views_marked_unapplied_total() -> &'static IntCounter {
    VIEWS_MARKED_UNAPPLIED_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "engage_gateway_views_marked_unapplied_total",
                "Views marked as seen whose durable increment failed.",
            )
            .expect("create engage_gateway_views_marked_unapplied_total"),
        )
    })
}

fn ratings_total() -> &'static IntCounterVec {
    RATINGS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "engage_gateway_ratings_total",
                    "Applied rating submissions.",
                ),
                &["outcome"],
            )
            .expect("create engage_gateway_ratings_total"),
        )
    })
}

fn storage_conflict_retries_total() -> &'static IntCounter {
    STORAGE_CONFLICT_RETRIES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "engage_gateway_storage_conflict_retries_total",
                "Store writes replayed after a serialization conflict.",
            )
            .expect("create engage_gateway_storage_conflict_retries_total"),
        )
    })
}

fn login_checks_total() -> &'static IntCounterVec {
    LOGIN_CHECKS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "engage_gateway_login_checks_total",
                    "Login throttle decisions by outcome.",
                ),
                &["outcome"],
            )
            .expect("create engage_gateway_login_checks_total"),
        )
    })
}

pub fn observe_http_request(route: &str, method: &str, status: u16, duration: Duration) {
    let status_str = status.to_string();
    http_requests_total()
        .with_label_values(&[route, method, status_str.as_str()])
        .inc();

    let outcome = if (200..400).contains(&status) {
        "success"
    } else {
        "error"
    };
    http_request_duration_seconds()
        .with_label_values(&[route, method, outcome])
        .observe(duration.as_secs_f64());
}

pub fn observe_view(outcome: &str) {
    views_total().with_label_values(&[outcome]).inc();
}

pub fn inc_view_marked_unapplied() {
    views_marked_unapplied_total().inc();
}

#[cfg(test)]
pub(crate) fn views_marked_unapplied() -> u64 {
    views_marked_unapplied_total().get()
}

pub fn observe_rating(outcome: &str) {
    ratings_total().with_label_values(&[outcome]).inc();
}

pub fn inc_storage_conflict_retry() {
    storage_conflict_retries_total().inc();
}

pub fn observe_login(outcome: &str) {
    login_checks_total().with_label_values(&[outcome]).inc();
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = views_marked_unapplied_total();
    let _ = storage_conflict_retries_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
