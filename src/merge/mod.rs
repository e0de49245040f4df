//! Merge module - the row-to-document batch pipeline.
//!
//! This module is framework-free and synchronous:
//! - `dataset` - tabular row sources (XLSX, CSV, JSON)
//! - `normalize` - raw cell to display string
//! - `naming` - filesystem-safe output names and per-run deduplication
//! - `context` - per-row substitution context (blank-on-missing)
//! - `template` - template loading and the `{{ name }}` substitution engine
//! - `renderer` - template + context to document bytes
//! - `archive` - ZIP packaging, in memory or staged on disk
//! - `orchestrator` - the batch loop, progress and cancellation
//! - `report` - run summary
//! - `convert` - optional per-document post-processing

pub mod archive;
pub mod context;
pub mod convert;
pub mod dataset;
pub mod naming;
pub mod normalize;
pub mod orchestrator;
pub mod renderer;
pub mod report;
pub mod template;

pub use archive::{ArchiveBlob, ArchiveError, ArchiveStaging, ArchiveWriter};
pub use context::RenderContext;
pub use convert::{ConversionError, ExternalConverter, PostProcessor};
pub use dataset::{Dataset, DatasetError, RawCell, Row};
pub use naming::{sanitize_filename, NameRegistry};
pub use normalize::normalize;
pub use orchestrator::{
    BatchOrchestrator, CancelFlag, NoProgress, ProgressSink, RunOptions, RunOutput,
};
pub use renderer::{DocumentPayload, DocumentRenderer, RenderError, TemplateRenderer};
pub use report::{FailureRecord, RunReport, RunState};
pub use template::{EngineError, Template, TemplateError, TemplateFormat};

use thiserror::Error;

/// Errors that stop a run before any row is processed.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("dataset could not be loaded: {0}")]
    Dataset(#[from] DatasetError),
    #[error("template could not be loaded: {0}")]
    Template(#[from] TemplateError),
    #[error("filename column '{0}' does not exist in the dataset")]
    UnknownColumn(String),
    #[error("output archive could not be created: {0}")]
    Archive(#[source] ArchiveError),
}

/// Terminal failure of a batch run, distinct from per-row failures.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Setup(#[from] SetupError),
    /// Storage failed while the archive was being written. The report holds
    /// what had been recorded up to that point.
    #[error("archive write failed after {} documents: {source}", report.succeeded)]
    Archive {
        #[source]
        source: ArchiveError,
        report: Box<RunReport>,
    },
}

impl BatchError {
    /// Partial report for failures that happened mid-run.
    pub fn partial_report(&self) -> Option<&RunReport> {
        match self {
            Self::Setup(_) => None,
            Self::Archive { report, .. } => Some(report),
        }
    }
}
