//! The batch loop.
//!
//! Rows are processed one at a time, in input order, in chunks of
//! `batch_size`. A row that fails to render is recorded and skipped; only
//! setup problems and archive storage failures stop the run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use super::archive::{ArchiveBlob, ArchiveStaging, ArchiveWriter};
use super::context::RenderContext;
use super::convert::PostProcessor;
use super::dataset::Dataset;
use super::naming::{sanitize_filename, NameRegistry};
use super::renderer::{DocumentPayload, DocumentRenderer, RenderError, TemplateRenderer};
use super::report::{FailureRecord, ReportBuilder, RunReport};
use super::template::Template;
use super::{BatchError, SetupError};

pub const DEFAULT_BATCH_SIZE: usize = 80;
pub const DEFAULT_FAILURE_PREVIEW: usize = 50;

/// Receives `(processed, total)` after every row.
pub trait ProgressSink {
    fn on_progress(&self, processed: usize, total: usize);
}

impl<F> ProgressSink for F
where
    F: Fn(usize, usize),
{
    fn on_progress(&self, processed: usize, total: usize) {
        self(processed, total)
    }
}

/// Sink that ignores progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&self, _processed: usize, _total: usize) {}
}

/// Cooperative cancellation, checked after each row except the last.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Knobs that never change which documents are produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub batch_size: usize,
    pub inter_row_pause: Duration,
    pub failure_preview_limit: usize,
    pub staging: ArchiveStaging,
    /// Cap on the uncompressed content of each archive; `None` is unbounded.
    pub max_archive_bytes: Option<u64>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            inter_row_pause: Duration::ZERO,
            failure_preview_limit: DEFAULT_FAILURE_PREVIEW,
            staging: ArchiveStaging::Memory,
            max_archive_bytes: None,
        }
    }
}

/// Everything a finished run hands back to its caller.
#[derive(Debug)]
pub struct RunOutput {
    pub report: RunReport,
    pub archive: ArchiveBlob,
    /// Present when a post-processor was configured.
    pub converted: Option<ArchiveBlob>,
    /// Output names of the successful rows, in archive order.
    pub output_names: Vec<String>,
}

/// Drives one run over a dataset.
pub struct BatchOrchestrator<R = TemplateRenderer> {
    renderer: R,
    options: RunOptions,
    post_processor: Option<Arc<dyn PostProcessor>>,
}

impl BatchOrchestrator<TemplateRenderer> {
    pub fn new(options: RunOptions) -> Self {
        Self::with_renderer(TemplateRenderer, options)
    }
}

impl<R: DocumentRenderer> BatchOrchestrator<R> {
    pub fn with_renderer(renderer: R, options: RunOptions) -> Self {
        Self {
            renderer,
            options,
            post_processor: None,
        }
    }

    pub fn with_post_processor(mut self, post_processor: Arc<dyn PostProcessor>) -> Self {
        self.post_processor = Some(post_processor);
        self
    }

    pub fn run(
        &self,
        dataset: &Dataset,
        template: &Template,
        filename_column: &str,
        progress: &dyn ProgressSink,
        cancel: &CancelFlag,
    ) -> Result<RunOutput, BatchError> {
        let name_index = dataset
            .column_index(filename_column)
            .ok_or_else(|| SetupError::UnknownColumn(filename_column.to_string()))?;

        let mut archive = self.open_archive()?;
        let mut converted = match self.post_processor {
            Some(_) => Some(self.open_archive()?),
            None => None,
        };

        let total = dataset.len();
        let mut report = ReportBuilder::new(total, self.options.failure_preview_limit);

        if dataset.is_empty() {
            info!("dataset has no rows, nothing to generate");
            return match archive.finalize() {
                Ok(archive) => Ok(RunOutput {
                    report: report.finish_empty(),
                    archive,
                    converted: finalize_converted(converted),
                    output_names: Vec::new(),
                }),
                Err(source) => Err(BatchError::Archive {
                    source,
                    report: Box::new(report.finish_aborted()),
                }),
            };
        }

        info!(
            "generating {} documents from template '{}' (batch size {}, naming column '{}')",
            total,
            template.name(),
            self.options.batch_size,
            filename_column
        );

        let extension = template.format().extension().to_string();
        let mut names = NameRegistry::new();
        let mut output_names = Vec::with_capacity(total);
        let mut cancelled = false;

        'chunks: for (chunk_index, chunk) in dataset.rows().chunks(self.options.batch_size.max(1)).enumerate() {
            debug!("processing chunk {} ({} rows)", chunk_index + 1, chunk.len());

            for row in chunk {
                let row_number = report.processed() + 1;
                let context = RenderContext::build(dataset.columns(), row);
                let base = sanitize_filename(
                    context.resolve(&dataset.columns()[name_index]),
                    &format!("row_{row_number}"),
                );
                let output_name = names.claim(&base);

                match self.renderer.render(template, &context) {
                    Ok(bytes) => {
                        let payload = DocumentPayload {
                            name: output_name,
                            extension: extension.clone(),
                            bytes,
                        };

                        if let Err(source) = archive.add(&payload.entry_name(), &payload.bytes) {
                            error!("archive write failed at row {}: {}", row_number, source);
                            return Err(BatchError::Archive {
                                source,
                                report: Box::new(report.finish_aborted()),
                            });
                        }
                        report.record_success();

                        if let (Some(processor), Some(target)) =
                            (self.post_processor.as_deref(), converted.as_mut())
                        {
                            convert_document(processor, target, &payload, row_number, &mut report);
                        }
                        output_names.push(payload.name);
                    }
                    Err(source) => {
                        let failure = RenderError {
                            row: row_number,
                            output_name,
                            source,
                        };
                        warn!("{}", failure);
                        report.record_failure(&failure);
                    }
                }

                progress.on_progress(report.processed(), total);

                if report.processed() < total && cancel.is_cancelled() {
                    info!("run cancelled after {} of {} rows", report.processed(), total);
                    cancelled = true;
                    break 'chunks;
                }

                if !self.options.inter_row_pause.is_zero() && report.processed() < total {
                    thread::sleep(self.options.inter_row_pause);
                }
            }
        }

        let archive = match archive.finalize() {
            Ok(archive) => archive,
            Err(source) => {
                error!("failed to finalize archive: {}", source);
                return Err(BatchError::Archive {
                    source,
                    report: Box::new(report.finish_aborted()),
                });
            }
        };

        let report = report.finish(cancelled);
        info!("{}", report.summary_line());

        Ok(RunOutput {
            report,
            archive,
            converted: finalize_converted(converted),
            output_names,
        })
    }

    fn open_archive(&self) -> Result<ArchiveWriter, SetupError> {
        ArchiveWriter::open(self.options.staging)
            .map(|writer| writer.with_limit(self.options.max_archive_bytes))
            .map_err(SetupError::Archive)
    }
}

/// Convert one document; failures are recorded and never fail the row.
fn convert_document(
    processor: &dyn PostProcessor,
    target: &mut ArchiveWriter,
    payload: &DocumentPayload,
    row_number: usize,
    report: &mut ReportBuilder,
) {
    let entry_name = format!("{}.{}", payload.name, processor.extension());
    let result = processor
        .convert(payload)
        .map_err(|e| e.to_string())
        .and_then(|bytes| target.add(&entry_name, &bytes).map_err(|e| e.to_string()));

    if let Err(message) = result {
        warn!("conversion of row {} ({}) failed: {}", row_number, payload.name, message);
        report.record_conversion_failure(FailureRecord {
            row: row_number,
            output_name: payload.name.clone(),
            error: message,
        });
    }
}

fn finalize_converted(converted: Option<ArchiveWriter>) -> Option<ArchiveBlob> {
    match converted?.finalize() {
        Ok(blob) => Some(blob),
        Err(e) => {
            warn!("failed to finalize converted archive: {}", e);
            None
        }
    }
}
