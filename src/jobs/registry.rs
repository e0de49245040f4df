use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::debug;
use moka::future::Cache;
use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::jobs::models::JobSnapshot;
use crate::merge::{ArchiveBlob, BatchError, CancelFlag, RunOutput, RunReport, RunState};

const EVENT_CAPACITY: usize = 256;

/// Progress notifications fanned out to SSE subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Progress { processed: usize, total: usize },
    Done { state: RunState, report: Option<RunReport>, error: Option<String> },
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. })
    }

    /// Server-sent event frame.
    pub fn to_sse(&self) -> String {
        let (name, data) = match self {
            Self::Progress { processed, total } => ("progress", json!({ "processed": processed, "total": total })),
            Self::Done { state, report, error } => (
                "done",
                json!({ "state": state, "report": report, "error": error }),
            ),
        };
        format!("event: {name}\ndata: {data}\n\n")
    }
}

#[derive(Debug)]
struct JobProgress {
    state: RunState,
    processed: usize,
    report: Option<RunReport>,
    error: Option<String>,
    archive: Option<Arc<ArchiveBlob>>,
    converted: Option<Arc<ArchiveBlob>>,
}

/// One submitted run and everything it produced.
#[derive(Debug)]
pub struct Job {
    id: Uuid,
    created_at: DateTime<Utc>,
    total: usize,
    cancel: CancelFlag,
    progress: RwLock<JobProgress>,
    events: broadcast::Sender<JobEvent>,
}

impl Job {
    pub fn new(total: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            total,
            cancel: CancelFlag::new(),
            progress: RwLock::new(JobProgress {
                state: RunState::NotStarted,
                processed: 0,
                report: None,
                error: None,
                archive: None,
                converted: None,
            }),
            events,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Ask the run to stop at its next row checkpoint.
    pub fn request_cancel(&self) {
        if !self.state().is_terminal() {
            self.cancel.cancel();
        }
    }

    pub fn state(&self) -> RunState {
        self.progress.read().state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn mark_running(&self) {
        self.progress.write().state = RunState::Running;
    }

    pub fn record_progress(&self, processed: usize, total: usize) {
        self.progress.write().processed = processed;
        let _ = self.events.send(JobEvent::Progress { processed, total });
    }

    pub fn complete(&self, output: RunOutput) {
        {
            let mut progress = self.progress.write();
            progress.state = output.report.state;
            progress.processed = output.report.processed;
            progress.archive = Some(Arc::new(output.archive));
            progress.converted = output.converted.map(Arc::new);
            progress.report = Some(output.report);
        }
        self.publish_done();
    }

    pub fn fail(&self, error: &BatchError) {
        self.abort(error.to_string(), error.partial_report());
    }

    /// Mark the job aborted unless it already reached a terminal state.
    pub fn abort(&self, message: String, report: Option<&RunReport>) {
        {
            let mut progress = self.progress.write();
            if progress.state.is_terminal() {
                return;
            }
            progress.state = RunState::Aborted;
            progress.error = Some(message);
            if let Some(report) = report {
                progress.processed = report.processed;
                progress.report = Some(report.clone());
            }
        }
        self.publish_done();
    }

    /// The `done` event once the job is terminal.
    pub fn terminal_event(&self) -> Option<JobEvent> {
        let progress = self.progress.read();
        progress.state.is_terminal().then(|| JobEvent::Done {
            state: progress.state,
            report: progress.report.clone(),
            error: progress.error.clone(),
        })
    }

    pub fn progress_event(&self) -> JobEvent {
        JobEvent::Progress {
            processed: self.progress.read().processed,
            total: self.total,
        }
    }

    /// The primary archive when it may be offered for download.
    pub fn archive(&self, offer_empty: bool) -> Option<Arc<ArchiveBlob>> {
        let progress = self.progress.read();
        let succeeded = progress.report.as_ref().map_or(0, |report| report.succeeded);
        if !progress.state.is_terminal() || (succeeded == 0 && !offer_empty) {
            return None;
        }
        progress.archive.clone()
    }

    pub fn converted(&self) -> Option<Arc<ArchiveBlob>> {
        let progress = self.progress.read();
        progress.converted.clone().filter(|blob| !blob.is_empty())
    }

    pub fn snapshot(&self, offer_empty: bool) -> JobSnapshot {
        let archive_available = self.archive(offer_empty).is_some();
        let converted_available = self.converted().is_some();
        let progress = self.progress.read();
        JobSnapshot {
            job_id: self.id,
            state: progress.state,
            processed: progress.processed,
            total: self.total,
            report: progress.report.clone(),
            error: progress.error.clone(),
            archive_available,
            converted_available,
            created_at: self.created_at,
        }
    }

    fn publish_done(&self) {
        if let Some(event) = self.terminal_event() {
            debug!("job {} finished: {}", self.id, self.state());
            let _ = self.events.send(event);
        }
    }
}

/// Jobs by id. Finished jobs expire after the configured time to live; their
/// staged archives are removed when the last reference is dropped.
#[derive(Clone)]
pub struct JobRegistry {
    jobs: Cache<Uuid, Arc<Job>>,
}

impl JobRegistry {
    pub fn new(ttl: Duration, max_jobs: u64) -> Self {
        let jobs = Cache::builder().time_to_live(ttl).max_capacity(max_jobs).build();
        Self { jobs }
    }

    pub async fn insert(&self, job: Arc<Job>) {
        self.jobs.insert(job.id(), job).await;
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<Job>> {
        self.jobs.get(&id).await
    }

    pub fn entry_count(&self) -> u64 {
        self.jobs.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::{ArchiveStaging, ArchiveWriter, FailureRecord};

    fn report(state: RunState, succeeded: usize, failed: usize) -> RunReport {
        RunReport {
            state,
            total: succeeded + failed,
            processed: succeeded + failed,
            succeeded,
            failed,
            failures: (1..=failed)
                .map(|row| FailureRecord {
                    row,
                    output_name: format!("row_{row}"),
                    error: "unterminated placeholder".into(),
                })
                .collect(),
            conversion_failed: 0,
            conversion_failures: Vec::new(),
            elapsed_seconds: 0.0,
            notice: None,
        }
    }

    fn output(report: RunReport) -> RunOutput {
        let archive = ArchiveWriter::open(ArchiveStaging::Memory).unwrap().finalize().unwrap();
        RunOutput {
            report,
            archive,
            converted: None,
            output_names: Vec::new(),
        }
    }

    #[test]
    fn test_sse_frames() {
        let frame = JobEvent::Progress { processed: 2, total: 5 }.to_sse();
        assert_eq!(frame, "event: progress\ndata: {\"processed\":2,\"total\":5}\n\n");

        let done = JobEvent::Done {
            state: RunState::Completed,
            report: None,
            error: None,
        };
        assert!(done.is_terminal());
        assert!(done.to_sse().starts_with("event: done\ndata: {\"state\":\"completed\""));
    }

    #[test]
    fn test_progress_is_published() {
        let job = Job::new(3);
        let mut events = job.subscribe();
        job.mark_running();
        job.record_progress(1, 3);

        assert_eq!(events.try_recv().unwrap(), JobEvent::Progress { processed: 1, total: 3 });
        assert_eq!(job.snapshot(false).processed, 1);
        assert!(job.terminal_event().is_none());
    }

    #[test]
    fn test_archive_withheld_without_successes() {
        let job = Job::new(2);
        job.complete(output(report(RunState::CompletedWithErrors, 0, 2)));

        assert!(job.archive(false).is_none());
        assert!(job.archive(true).is_some());
        assert!(!job.snapshot(false).archive_available);
        assert!(job.terminal_event().is_some());
    }

    #[test]
    fn test_cancel_ignored_once_terminal() {
        let job = Job::new(1);
        job.complete(output(report(RunState::Completed, 1, 0)));
        job.request_cancel();
        assert!(!job.cancel_flag().is_cancelled());
        assert!(job.archive(false).is_some());
    }

    #[test]
    fn test_abort_keeps_first_terminal_state() {
        let job = Job::new(1);
        let mut events = job.subscribe();
        job.mark_running();
        job.abort("worker stopped".into(), None);

        assert_eq!(job.state(), RunState::Aborted);
        assert!(events.try_recv().unwrap().is_terminal());

        job.abort("again".into(), None);
        assert_eq!(job.snapshot(false).error.as_deref(), Some("worker stopped"));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let registry = JobRegistry::new(Duration::from_secs(60), 8);
        let job = Arc::new(Job::new(0));
        registry.insert(Arc::clone(&job)).await;

        assert_eq!(registry.get(job.id()).await.map(|found| found.id()), Some(job.id()));
        assert!(registry.get(Uuid::new_v4()).await.is_none());
    }
}
