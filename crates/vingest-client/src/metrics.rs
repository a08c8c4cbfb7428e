//! Client metrics.

use metrics::{counter, gauge, histogram};

/// Metric name constants for consistency.
pub mod names {
    /// Calls by dependency, operation and outcome.
    pub const CALLS_TOTAL: &str = "vingest_client_calls_total";

    /// Retries by dependency and operation.
    pub const RETRIES_TOTAL: &str = "vingest_client_retries_total";

    /// Per-attempt latency in seconds.
    pub const ATTEMPT_SECONDS: &str = "vingest_client_attempt_seconds";

    /// Circuit transitions by dependency and target state.
    pub const CIRCUIT_TRANSITIONS_TOTAL: &str = "vingest_client_circuit_transitions_total";

    /// Current circuit state (0 closed, 1 half-open, 2 open).
    pub const CIRCUIT_STATE: &str = "vingest_client_circuit_state";

    /// Calls rejected without reaching the dependency.
    pub const SHORT_CIRCUITED_TOTAL: &str = "vingest_client_short_circuited_total";
}

pub fn record_call(dependency: &str, operation: &'static str, outcome: &'static str) {
    counter!(
        names::CALLS_TOTAL,
        "dependency" => dependency.to_string(),
        "operation" => operation,
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_attempt_latency(dependency: &str, operation: &'static str, seconds: f64) {
    histogram!(
        names::ATTEMPT_SECONDS,
        "dependency" => dependency.to_string(),
        "operation" => operation
    )
    .record(seconds);
}

pub fn record_retry(dependency: &str, operation: &'static str) {
    counter!(
        names::RETRIES_TOTAL,
        "dependency" => dependency.to_string(),
        "operation" => operation
    )
    .increment(1);
}

pub fn record_short_circuit(dependency: &str, operation: &'static str) {
    counter!(
        names::SHORT_CIRCUITED_TOTAL,
        "dependency" => dependency.to_string(),
        "operation" => operation
    )
    .increment(1);
}

pub fn record_circuit_transition(dependency: &str, to: &'static str) {
    counter!(
        names::CIRCUIT_TRANSITIONS_TOTAL,
        "dependency" => dependency.to_string(),
        "to" => to
    )
    .increment(1);

    let value = match to {
        "closed" => 0.0,
        "half_open" => 1.0,
        _ => 2.0,
    };
    gauge!(names::CIRCUIT_STATE, "dependency" => dependency.to_string()).set(value);
}
