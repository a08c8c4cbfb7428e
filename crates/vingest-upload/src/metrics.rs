//! Upload metrics.

use metrics::{counter, histogram};

/// Metric name constants for consistency.
pub mod names {
    /// Sessions created.
    pub const SESSIONS_CREATED_TOTAL: &str = "vingest_upload_sessions_created_total";

    /// Sessions reaching a terminal status, by status.
    pub const SESSIONS_FINISHED_TOTAL: &str = "vingest_upload_sessions_finished_total";

    /// Chunk requests by outcome (accepted, duplicate, rejected).
    pub const CHUNKS_TOTAL: &str = "vingest_upload_chunks_total";

    /// Payload bytes accepted.
    pub const CHUNK_BYTES_TOTAL: &str = "vingest_upload_chunk_bytes_total";

    /// Assembly duration in seconds.
    pub const ASSEMBLY_SECONDS: &str = "vingest_upload_assembly_seconds";
}

pub fn record_session_created() {
    counter!(names::SESSIONS_CREATED_TOTAL).increment(1);
}

pub fn record_session_finished(status: &'static str) {
    counter!(names::SESSIONS_FINISHED_TOTAL, "status" => status).increment(1);
}

pub fn record_chunk(outcome: &'static str, bytes: usize) {
    counter!(names::CHUNKS_TOTAL, "outcome" => outcome).increment(1);
    if outcome == "accepted" {
        counter!(names::CHUNK_BYTES_TOTAL).increment(bytes as u64);
    }
}

pub fn record_assembly(seconds: f64) {
    histogram!(names::ASSEMBLY_SECONDS).record(seconds);
}
