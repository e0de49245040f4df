use std::sync::Arc;

use log::{error, info};
use tokio::task::JoinHandle;

use crate::jobs::registry::Job;
use crate::merge::{BatchOrchestrator, Dataset, DocumentRenderer, Template};
use crate::metrics;

/// Everything a background run needs, moved onto a blocking worker.
pub struct RunRequest {
    pub dataset: Dataset,
    pub template: Template,
    pub filename_column: String,
}

/// Run the job on the blocking pool and record its outcome.
///
/// The returned handle resolves once the job is terminal, including when the
/// worker panicked.
pub fn spawn<R>(job: Arc<Job>, orchestrator: BatchOrchestrator<R>, request: RunRequest) -> JoinHandle<()>
where
    R: DocumentRenderer + Send + 'static,
{
    job.mark_running();
    info!(
        "job {} started: {} rows, template '{}'",
        job.id(),
        job.total(),
        request.template.name()
    );

    let worker_job = Arc::clone(&job);
    let worker = tokio::task::spawn_blocking(move || execute(&worker_job, &orchestrator, &request));

    tokio::spawn(async move {
        if let Err(e) = worker.await {
            error!("job {} worker stopped unexpectedly: {}", job.id(), e);
            metrics::record_crash();
            job.abort(format!("run stopped unexpectedly: {e}"), None);
        }
    })
}

fn execute<R: DocumentRenderer>(job: &Job, orchestrator: &BatchOrchestrator<R>, request: &RunRequest) {
    let sink = |processed: usize, total: usize| job.record_progress(processed, total);
    let result = orchestrator.run(
        &request.dataset,
        &request.template,
        &request.filename_column,
        &sink,
        job.cancel_flag(),
    );

    match result {
        Ok(output) => {
            metrics::record_run(&output.report);
            info!("job {} {}", job.id(), output.report.summary_line());
            job.complete(output);
        }
        Err(e) => {
            match e.partial_report() {
                Some(report) => metrics::record_run(report),
                None => metrics::record_setup_failure(),
            }
            error!("job {} aborted: {}", job.id(), e);
            job.fail(&e);
        }
    }
}
