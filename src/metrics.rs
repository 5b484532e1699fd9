//! Metrics module
//!
//! Prometheus counters for the upload pipeline, registered in the default
//! registry.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, Counter, CounterVec, Encoder,
    Histogram, TextEncoder,
};

lazy_static! {
    pub static ref PARTS_UPLOADED: Counter = register_counter!(
        "cmd2s3_parts_uploaded_total",
        "Parts uploaded successfully"
    ).unwrap();

    pub static ref BYTES_UPLOADED: Counter = register_counter!(
        "cmd2s3_bytes_uploaded_total",
        "Bytes uploaded in successful parts"
    ).unwrap();

    pub static ref PART_DURATION: Histogram = register_histogram!(
        "cmd2s3_part_upload_duration_seconds",
        "Part upload duration in seconds",
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).unwrap();

    pub static ref UPLOADS_TOTAL: CounterVec = register_counter_vec!(
        "cmd2s3_uploads_total",
        "Multipart uploads by outcome",
        &["status"]  // "completed" or "aborted"
    ).unwrap();

    pub static ref ABORT_FAILURES: Counter = register_counter!(
        "cmd2s3_abort_failures_total",
        "Abort requests that failed"
    ).unwrap();

    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "cmd2s3_errors_total",
        "Errors that ended an upload",
        &["type"]
    ).unwrap();
}

/// Record a successfully uploaded part
pub fn record_part(bytes: usize, duration_secs: f64) {
    PARTS_UPLOADED.inc();
    BYTES_UPLOADED.inc_by(bytes as f64);
    PART_DURATION.observe(duration_secs);
}

pub fn record_upload_completed() {
    UPLOADS_TOTAL.with_label_values(&["completed"]).inc();
}

pub fn record_upload_aborted() {
    UPLOADS_TOTAL.with_label_values(&["aborted"]).inc();
}

pub fn record_abort_failure() {
    ABORT_FAILURES.inc();
}

/// Record the error that ended an upload
pub fn record_error(error_type: &str) {
    ERRORS_TOTAL.with_label_values(&[error_type]).inc();
}

/// Render the default registry in the Prometheus text format
pub fn render() -> String {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_part() {
        record_part(1024, 0.25);
        // Just verify it doesn't panic
    }

    #[test]
    fn test_render_contains_counters() {
        record_upload_completed();
        record_error("upload_part");

        let text = render();
        assert!(text.contains("cmd2s3_uploads_total"));
        assert!(text.contains("cmd2s3_errors_total"));
    }
}
