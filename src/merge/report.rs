//! Run summary.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::renderer::RenderError;

/// Notice attached to runs over a dataset without rows.
pub const EMPTY_DATASET_NOTICE: &str = "empty dataset";

/// Lifecycle of a batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Running,
    Completed,
    CompletedWithErrors,
    /// Stopped at a row checkpoint on request; unprocessed rows are absent.
    Cancelled,
    /// Stopped by a storage failure while writing the archive.
    Aborted,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::NotStarted | Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Cancelled => "cancelled",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row that did not produce a document (or a converted copy).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// 1-based row index.
    pub row: usize,
    pub output_name: String,
    pub error: String,
}

impl From<&RenderError> for FailureRecord {
    fn from(error: &RenderError) -> Self {
        Self {
            row: error.row,
            output_name: error.output_name.clone(),
            error: error.source.to_string(),
        }
    }
}

/// Read-only outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub state: RunState,
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    /// All failed rows, including those beyond the preview.
    pub failed: usize,
    /// First failures, in row order.
    pub failures: Vec<FailureRecord>,
    /// Documents whose conversion failed; these rows still count as succeeded.
    pub conversion_failed: usize,
    /// First conversion failures.
    pub conversion_failures: Vec<FailureRecord>,
    pub elapsed_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
}

impl RunReport {
    pub fn summary_line(&self) -> String {
        let mut line = format!(
            "{}: {}/{} documents generated, {} failed, {:.1}s",
            self.state, self.succeeded, self.total, self.failed, self.elapsed_seconds
        );
        if self.processed < self.total {
            line.push_str(&format!(" ({} rows not processed)", self.total - self.processed));
        }
        if let Some(notice) = &self.notice {
            line.push_str(&format!(" [{notice}]"));
        }
        line
    }
}

/// Accumulates counts while the orchestrator walks the rows.
#[derive(Debug)]
pub struct ReportBuilder {
    started: Instant,
    total: usize,
    processed: usize,
    succeeded: usize,
    failed: usize,
    preview_limit: usize,
    failures: Vec<FailureRecord>,
    conversion_failures: Vec<FailureRecord>,
    conversion_failed: usize,
}

impl ReportBuilder {
    pub fn new(total: usize, preview_limit: usize) -> Self {
        Self {
            started: Instant::now(),
            total,
            processed: 0,
            succeeded: 0,
            failed: 0,
            preview_limit,
            failures: Vec::new(),
            conversion_failures: Vec::new(),
            conversion_failed: 0,
        }
    }

    pub fn processed(&self) -> usize {
        self.processed
    }

    pub fn record_success(&mut self) {
        self.processed += 1;
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self, error: &RenderError) {
        self.processed += 1;
        self.failed += 1;
        if self.failures.len() < self.preview_limit {
            self.failures.push(FailureRecord::from(error));
        }
    }

    pub fn record_conversion_failure(&mut self, record: FailureRecord) {
        self.conversion_failed += 1;
        if self.conversion_failures.len() < self.preview_limit {
            self.conversion_failures.push(record);
        }
    }

    /// Terminal report for a run that walked its rows (or was cancelled).
    pub fn finish(self, cancelled: bool) -> RunReport {
        let state = if cancelled {
            RunState::Cancelled
        } else if self.failed > 0 {
            RunState::CompletedWithErrors
        } else {
            RunState::Completed
        };
        self.into_report(state, None)
    }

    pub fn finish_empty(self) -> RunReport {
        self.into_report(RunState::Completed, Some(EMPTY_DATASET_NOTICE.to_string()))
    }

    pub fn finish_aborted(self) -> RunReport {
        self.into_report(RunState::Aborted, None)
    }

    fn into_report(self, state: RunState, notice: Option<String>) -> RunReport {
        RunReport {
            state,
            total: self.total,
            processed: self.processed,
            succeeded: self.succeeded,
            failed: self.failed,
            failures: self.failures,
            conversion_failed: self.conversion_failed,
            conversion_failures: self.conversion_failures,
            elapsed_seconds: self.started.elapsed().as_secs_f64(),
            notice,
        }
    }
}
