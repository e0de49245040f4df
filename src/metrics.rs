//! Pipeline counters, registered in the default Prometheus registry.

use lazy_static::lazy_static;
use prometheus::{register_int_counter, register_int_counter_vec, Encoder, IntCounter, IntCounterVec, TextEncoder};

use crate::merge::RunReport;

lazy_static! {
    pub static ref DOCUMENTS_GENERATED: IntCounter = register_int_counter!(
        "docmerge_documents_generated_total",
        "Documents rendered and added to an archive"
    )
    .unwrap();
    pub static ref ROWS_FAILED: IntCounter = register_int_counter!(
        "docmerge_rows_failed_total",
        "Rows whose document could not be rendered"
    )
    .unwrap();
    pub static ref CONVERSIONS_FAILED: IntCounter = register_int_counter!(
        "docmerge_conversions_failed_total",
        "Documents whose post-processing conversion failed"
    )
    .unwrap();
    pub static ref RUNS_FINISHED: IntCounterVec = register_int_counter_vec!(
        "docmerge_runs_finished_total",
        "Batch runs by terminal state",
        &["state"]
    )
    .unwrap();
}

/// Fold a finished run into the counters.
pub fn record_run(report: &RunReport) {
    DOCUMENTS_GENERATED.inc_by(report.succeeded as u64);
    ROWS_FAILED.inc_by(report.failed as u64);
    CONVERSIONS_FAILED.inc_by(report.conversion_failed as u64);
    RUNS_FINISHED.with_label_values(&[report.state.as_str()]).inc();
}

/// Runs that ended before a report existed.
pub fn record_setup_failure() {
    RUNS_FINISHED.with_label_values(&["setup_failed"]).inc();
}

/// Runs whose worker died without reporting.
pub fn record_crash() {
    RUNS_FINISHED.with_label_values(&["crashed"]).inc();
}

/// Text exposition of every metric in the default registry.
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
