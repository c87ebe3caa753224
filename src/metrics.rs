//! Prometheus metrics for collection runs
//!
//! Counters are observational only; no engine decision reads them back.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter_vec, CounterVec, Encoder,
    HistogramVec, IntCounterVec, TextEncoder,
};

lazy_static! {
    /// Counter: requests handed to the transport, per connection
    pub static ref REQUESTS_DISPATCHED: IntCounterVec = register_int_counter_vec!(
        "collectkit_requests_dispatched_total",
        "Requests dispatched after acquiring a rate-limit slot",
        &["connection"]
    )
    .expect("Failed to create requests_dispatched metric");

    /// Counter: responses by status class (2xx, 4xx, 5xx, error)
    pub static ref RESPONSES: IntCounterVec = register_int_counter_vec!(
        "collectkit_responses_total",
        "Responses received by status class",
        &["connection", "class"]
    )
    .expect("Failed to create responses metric");

    /// Counter: raw units persisted per table
    pub static ref RAW_UNITS: IntCounterVec = register_int_counter_vec!(
        "collectkit_raw_units_total",
        "Raw units committed to the raw layer",
        &["table"]
    )
    .expect("Failed to create raw_units metric");

    /// Counter: pages replayed from the page ledger instead of fetched
    pub static ref PAGES_RESUMED: IntCounterVec = register_int_counter_vec!(
        "collectkit_pages_resumed_total",
        "Pages skipped because a previous run already committed them",
        &["table"]
    )
    .expect("Failed to create pages_resumed metric");

    /// Counter: stage runs by outcome
    pub static ref STAGE_RUNS: CounterVec = register_counter_vec!(
        "collectkit_stage_runs_total",
        "Stage runs by outcome",
        &["stage", "outcome"]
    )
    .expect("Failed to create stage_runs metric");

    /// Histogram: stage duration (seconds)
    pub static ref STAGE_DURATION: HistogramVec = register_histogram_vec!(
        "collectkit_stage_duration_seconds",
        "Duration of collect, extract and convert stages",
        &["stage"],
        vec![0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0, 1800.0]
    )
    .expect("Failed to create stage_duration metric");
}

pub fn record_dispatch(connection: u64) {
    REQUESTS_DISPATCHED
        .with_label_values(&[&connection.to_string()])
        .inc();
}

/// Record a response status; `None` means the transport failed
pub fn record_response(connection: u64, status: Option<u16>) {
    let class = match status {
        Some(200..=299) => "2xx",
        Some(300..=399) => "3xx",
        Some(400..=499) => "4xx",
        Some(_) => "5xx",
        None => "error",
    };
    RESPONSES
        .with_label_values(&[&connection.to_string(), class])
        .inc();
}

pub fn record_raw_units(table: &str, count: usize) {
    RAW_UNITS.with_label_values(&[table]).inc_by(count as u64);
}

pub fn record_page_resumed(table: &str) {
    PAGES_RESUMED.with_label_values(&[table]).inc();
}

/// Record a finished stage run
pub fn record_stage(stage: &str, outcome: &str, duration_secs: f64) {
    STAGE_RUNS.with_label_values(&[stage, outcome]).inc();
    STAGE_DURATION
        .with_label_values(&[stage])
        .observe(duration_secs);
}

/// Encode all metrics as Prometheus text format
pub fn encode_metrics() -> crate::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| crate::CollectError::Other(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| crate::CollectError::Other(format!("Metrics are not UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_show_up_in_exposition() {
        record_dispatch(99);
        record_response(99, Some(404));
        record_raw_units("metrics_test_table", 3);
        record_page_resumed("metrics_test_table");
        record_stage("collect", "completed", 0.25);

        let text = encode_metrics().unwrap();
        assert!(text.contains("collectkit_requests_dispatched_total"));
        assert!(text.contains("class=\"4xx\""));
        assert!(text.contains("collectkit_raw_units_total"));
        assert!(text.contains("collectkit_stage_duration_seconds"));
    }

    #[test]
    fn test_raw_unit_counter_increments() {
        let before = RAW_UNITS.with_label_values(&["metrics_inc_table"]).get();
        record_raw_units("metrics_inc_table", 5);
        let after = RAW_UNITS.with_label_values(&["metrics_inc_table"]).get();
        assert_eq!(after - before, 5);
    }
}
