//! Dispatch and delivery metrics.

use metrics::{counter, histogram};

/// Metric name constants for consistency.
pub mod names {
    /// Jobs published by outcome (published, deduplicated, failed).
    pub const DISPATCH_TOTAL: &str = "vingest_dispatch_total";

    /// Publish retries.
    pub const DISPATCH_RETRIES_TOTAL: &str = "vingest_dispatch_retries_total";

    /// Time from first publish attempt to outcome, in seconds.
    pub const DISPATCH_DURATION_SECONDS: &str = "vingest_dispatch_duration_seconds";

    /// Deliveries handed to consumers.
    pub const DELIVERIES_TOTAL: &str = "vingest_deliveries_total";
}

pub fn record_dispatch(outcome: &'static str, duration_secs: f64) {
    counter!(names::DISPATCH_TOTAL, "outcome" => outcome).increment(1);
    histogram!(names::DISPATCH_DURATION_SECONDS, "outcome" => outcome).record(duration_secs);
}

pub fn record_dispatch_retry() {
    counter!(names::DISPATCH_RETRIES_TOTAL).increment(1);
}

pub fn record_delivery(consumer: &str) {
    counter!(names::DELIVERIES_TOTAL, "consumer" => consumer.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names() {
        assert!(names::DISPATCH_TOTAL.starts_with("vingest_"));
        assert!(names::DISPATCH_RETRIES_TOTAL.contains("retries"));
    }
}
