//! Download manager - scheduling and orchestration of download jobs
//!
//! One bounded queue feeds a dispatch loop that hands jobs to worker tasks,
//! each holding an owned semaphore permit so at most
//! `max_concurrent_downloads` jobs run at once. Workers drive the
//! fetch / clip / store pipeline and are the only writers to their job;
//! cancellation is the single cross-writer exception.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clip::{ClipError, ClipExtractor};
use crate::core::config::ManagerConfig;
use crate::core::error_handling::JobError;
use crate::core::events::{EventBus, JobEvent};
use crate::core::models::{DownloadRequest, Job, JobStatus, QueueStatus};
use crate::source::{FetchSpec, MediaSource, ProgressFn, SourceError};
use crate::storage::SinkRegistry;
use crate::utils::file_utils::ensure_dir_exists;

/// Shared state reachable from the manager, the dispatch loop, and workers
struct ManagerInner {
    config: ManagerConfig,
    source: Arc<dyn MediaSource>,
    extractor: Arc<dyn ClipExtractor>,
    sinks: Arc<SinkRegistry>,
    jobs: DashMap<String, Job>,
    cancel_tokens: DashMap<String, CancellationToken>,
    semaphore: Arc<Semaphore>,
    events: EventBus,
}

impl ManagerInner {
    /// Apply a mutation to a job if it exists. Returns the updated snapshot.
    fn update_job<F: FnOnce(&mut Job)>(&self, job_id: &str, mutate: F) -> Option<Job> {
        let mut entry = self.jobs.get_mut(job_id)?;
        mutate(entry.value_mut());
        Some(entry.value().clone())
    }

    /// Move a job to `status` unless it is already terminal. Terminal states
    /// are absorbing; a refused transition returns false.
    fn transition(&self, job_id: &str, status: JobStatus) -> bool {
        let mut entry = match self.jobs.get_mut(job_id) {
            Some(entry) => entry,
            None => return false,
        };
        let job = entry.value_mut();
        if job.status.is_terminal() {
            return false;
        }
        job.status = status;
        match status {
            JobStatus::Downloading => job.started_at = Some(Utc::now()),
            s if s.is_terminal() => job.completed_at = Some(Utc::now()),
            _ => {}
        }
        drop(entry);

        self.events.publish(JobEvent::StatusChanged {
            job_id: job_id.to_string(),
            status,
        });
        true
    }

    fn fail_job(&self, job_id: &str, error: &JobError) {
        let message = error.to_string();
        let changed = {
            let mut entry = match self.jobs.get_mut(job_id) {
                Some(entry) => entry,
                None => return,
            };
            let job = entry.value_mut();
            if job.status.is_terminal() {
                false
            } else {
                job.status = JobStatus::Failed;
                job.error = Some(message.clone());
                job.completed_at = Some(Utc::now());
                true
            }
        };
        if changed {
            warn!("job {} failed: {}", job_id, message);
            self.events.publish(JobEvent::Failed {
                job_id: job_id.to_string(),
                error: message,
            });
        }
    }

    fn cancel_job(&self, job_id: &str) -> bool {
        if self.transition(job_id, JobStatus::Cancelled) {
            self.events.publish(JobEvent::Cancelled {
                job_id: job_id.to_string(),
            });
            true
        } else {
            false
        }
    }

    fn job_work_dir(&self, job_id: &str) -> std::path::PathBuf {
        self.config.work_dir.join(job_id)
    }
}

type QueueReceiver = mpsc::Receiver<String>;

/// The scheduler: accepts jobs, bounds concurrency, tracks lifecycle
pub struct DownloadManager {
    inner: Arc<ManagerInner>,
    queue_tx: mpsc::Sender<String>,
    /// The dispatch loop borrows the receiver while running and returns it on
    /// shutdown, which makes start/stop cycles resumable.
    queue_rx: Arc<tokio::sync::Mutex<Option<QueueReceiver>>>,
    shutdown: parking_lot::Mutex<CancellationToken>,
    dispatch_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    worker_handles: Arc<parking_lot::Mutex<Vec<JoinHandle<()>>>>,
    running: AtomicBool,
}

impl DownloadManager {
    pub fn new(
        config: ManagerConfig,
        source: Arc<dyn MediaSource>,
        extractor: Arc<dyn ClipExtractor>,
        sinks: Arc<SinkRegistry>,
    ) -> Result<Self, JobError> {
        if config.max_concurrent_downloads == 0 {
            return Err(JobError::Validation(
                "max_concurrent_downloads must be at least 1".to_string(),
            ));
        }
        if config.queue_size_limit == 0 {
            return Err(JobError::Validation(
                "queue_size_limit must be at least 1".to_string(),
            ));
        }

        let (queue_tx, queue_rx) = mpsc::channel(config.queue_size_limit);
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_downloads));
        let events = EventBus::new(config.event_channel_capacity);

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                source,
                extractor,
                sinks,
                jobs: DashMap::new(),
                cancel_tokens: DashMap::new(),
                semaphore,
                events,
            }),
            queue_tx,
            queue_rx: Arc::new(tokio::sync::Mutex::new(Some(queue_rx))),
            shutdown: parking_lot::Mutex::new(CancellationToken::new()),
            dispatch_handle: tokio::sync::Mutex::new(None),
            worker_handles: Arc::new(parking_lot::Mutex::new(Vec::new())),
            running: AtomicBool::new(false),
        })
    }

    /// Subscribe to job lifecycle and progress events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Validate and enqueue a request. Never blocks: when the queue is full
    /// the job is still created and registered, but immediately Failed with a
    /// queue-full error.
    pub fn submit(&self, request: DownloadRequest) -> Result<Job, JobError> {
        request.validate()?;

        let job_id = Uuid::new_v4().to_string();
        let job = Job::new(job_id.clone(), request);
        self.inner.jobs.insert(job_id.clone(), job.clone());
        self.inner
            .cancel_tokens
            .insert(job_id.clone(), CancellationToken::new());

        self.inner
            .events
            .publish(JobEvent::Submitted { job: job.clone() });

        match self.queue_tx.try_send(job_id.clone()) {
            Ok(()) => {
                debug!("job {} queued ({})", job_id, job.asset_id);
                Ok(job)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let error = JobError::QueueFull {
                    capacity: self.inner.config.queue_size_limit,
                };
                self.inner.fail_job(&job_id, &error);
                self.inner
                    .get_job(&job_id)
                    .ok_or_else(|| JobError::Internal("job vanished after submit".to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                let error = JobError::Internal("job queue is closed".to_string());
                self.inner.fail_job(&job_id, &error);
                Err(error)
            }
        }
    }

    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.inner.get_job(job_id)
    }

    /// List jobs, newest first, optionally filtered by status.
    pub fn list(&self, status: Option<JobStatus>, limit: Option<usize>) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .inner
            .jobs
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|job| status.map_or(true, |s| job.status == s))
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            jobs.truncate(limit);
        }
        jobs
    }

    /// Cancel a job. Returns false for unknown or already-terminal jobs, so
    /// repeated cancels are harmless.
    pub fn cancel(&self, job_id: &str) -> bool {
        let exists_non_terminal = self
            .inner
            .get_job(job_id)
            .map(|job| !job.status.is_terminal())
            .unwrap_or(false);
        if !exists_non_terminal {
            return false;
        }

        if let Some(token) = self.inner.cancel_tokens.get(job_id) {
            token.cancel();
        }
        let cancelled = self.inner.cancel_job(job_id);
        if cancelled {
            info!("🚫 Cancelled job {}", job_id);
        }
        cancelled
    }

    pub fn queue_status(&self) -> QueueStatus {
        let mut pending = 0;
        let mut active = 0;
        let mut completed = 0;
        let mut failed = 0;
        let total = self.inner.jobs.len();

        for entry in self.inner.jobs.iter() {
            match entry.value().status {
                JobStatus::Pending => pending += 1,
                JobStatus::Downloading | JobStatus::Processing => active += 1,
                JobStatus::Completed => completed += 1,
                JobStatus::Failed | JobStatus::Cancelled => failed += 1,
            }
        }

        let estimated_wait_secs = if pending > 0 {
            let workers = (active as u64).max(1);
            Some(pending as u64 / workers * self.inner.config.assumed_job_duration_secs)
        } else {
            None
        };

        QueueStatus {
            total_jobs: total,
            pending_jobs: pending,
            active_jobs: active,
            completed_jobs: completed,
            failed_jobs: failed,
            queue_capacity: self.inner.config.queue_size_limit,
            estimated_wait_secs,
        }
    }

    /// Remove terminal jobs from the registry. Running and pending jobs are
    /// untouched. Returns the number removed.
    pub fn clear_completed(&self) -> usize {
        let before = self.inner.jobs.len();
        self.inner.jobs.retain(|_, job| !job.status.is_terminal());
        self.inner
            .cancel_tokens
            .retain(|id, _| self.inner.jobs.contains_key(id));
        let removed = before - self.inner.jobs.len();
        if removed > 0 {
            info!("🧹 Cleared {} finished jobs", removed);
        }
        removed
    }

    /// Start the dispatch loop. Idempotent.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let shutdown = CancellationToken::new();
        *self.shutdown.lock() = shutdown.clone();

        let inner = Arc::clone(&self.inner);
        let queue_rx = Arc::clone(&self.queue_rx);
        let worker_handles = Arc::clone(&self.worker_handles);

        let handle = tokio::spawn(async move {
            let mut rx = match queue_rx.lock().await.take() {
                Some(rx) => rx,
                None => {
                    error!("dispatch loop already holds the queue receiver");
                    return;
                }
            };
            info!(
                "🚀 Download manager started (max {} concurrent)",
                inner.config.max_concurrent_downloads
            );

            loop {
                let job_id = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    job_id = rx.recv() => match job_id {
                        Some(job_id) => job_id,
                        None => break,
                    },
                };

                // Jobs cancelled while queued are already terminal; skip
                // before a permit is spent on them.
                match inner.get_job(&job_id) {
                    Some(job) if job.status == JobStatus::Pending => {}
                    _ => {
                        debug!("skipping dequeued job {} (no longer pending)", job_id);
                        continue;
                    }
                }

                let permit = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    permit = Arc::clone(&inner.semaphore).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                // Mark the job active before the worker exists. stop() scans
                // statuses after this loop has fully drained, so every
                // spawned worker is guaranteed to see its token cancelled.
                if !inner.transition(&job_id, JobStatus::Downloading) {
                    debug!("job {} went terminal before spawn", job_id);
                    continue;
                }

                let cancel = inner
                    .cancel_tokens
                    .get(&job_id)
                    .map(|t| t.value().clone())
                    .unwrap_or_default();
                let worker = tokio::spawn(run_job(
                    Arc::clone(&inner),
                    job_id,
                    cancel,
                    permit,
                ));

                let mut handles = worker_handles.lock();
                handles.retain(|h| !h.is_finished());
                handles.push(worker);
            }

            *queue_rx.lock().await = Some(rx);
            info!("dispatch loop stopped");
        });

        *self.dispatch_handle.lock().await = Some(handle);
    }

    /// Stop the dispatch loop, cancel every active job, and wait for workers
    /// to finish. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("🛑 Stopping download manager");

        self.shutdown.lock().cancel();
        if let Some(handle) = self.dispatch_handle.lock().await.take() {
            let _ = handle.await;
        }

        // Cancel whatever is still running; workers observe their tokens and
        // finish with a Cancelled status.
        for entry in self.inner.jobs.iter() {
            if entry.value().status.is_active() {
                if let Some(token) = self.inner.cancel_tokens.get(entry.key()) {
                    token.cancel();
                }
            }
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.worker_handles.lock();
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("✅ Download manager stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl ManagerInner {
    fn get_job(&self, job_id: &str) -> Option<Job> {
        self.jobs.get(job_id).map(|entry| entry.value().clone())
    }
}

/// Drive one job through the fetch / clip / store pipeline.
///
/// Holds its semaphore permit for the whole run; dropping it on any exit path
/// frees a worker slot.
async fn run_job(
    inner: Arc<ManagerInner>,
    job_id: String,
    cancel: CancellationToken,
    _permit: OwnedSemaphorePermit,
) {
    // The dispatch loop moved the job to Downloading before spawning; a
    // cancel can still land in the gap.
    if cancel.is_cancelled() {
        inner.cancel_job(&job_id);
        return;
    }
    let request = match inner.get_job(&job_id) {
        Some(job) if job.status == JobStatus::Downloading => job.request,
        _ => return,
    };
    info!("job {} downloading {}", job_id, request.asset_id);

    let work_dir = inner.job_work_dir(&job_id);
    if let Err(e) = ensure_dir_exists(&work_dir) {
        inner.fail_job(&job_id, &JobError::Internal(e.to_string()));
        return;
    }

    let spec = FetchSpec {
        asset_id: request.asset_id.clone(),
        quality: request.quality,
        format: request.format,
        subtitles: request.subtitles.clone(),
    };
    let progress_fn: ProgressFn = {
        let inner = Arc::clone(&inner);
        let job_id = job_id.clone();
        Arc::new(move |progress| {
            inner.update_job(&job_id, |job| job.progress = progress.clone());
            inner.events.publish(JobEvent::Progress {
                job_id: job_id.clone(),
                progress,
            });
        })
    };

    let outcome = match inner
        .source
        .fetch(&spec, &work_dir, progress_fn, cancel.clone())
        .await
    {
        Ok(outcome) => outcome,
        Err(SourceError::Cancelled) => {
            finish_cancelled(&inner, &job_id, &work_dir).await;
            return;
        }
        Err(e) => {
            let error = match e {
                SourceError::Unavailable(msg) => JobError::SourceUnavailable(msg),
                SourceError::Transfer(msg) => JobError::Transfer(msg),
                SourceError::Io(msg) => JobError::Transfer(msg),
                SourceError::Cancelled => JobError::Cancelled,
            };
            inner.fail_job(&job_id, &error);
            return;
        }
    };

    if !inner.transition(&job_id, JobStatus::Processing) {
        // Cancelled during the fetch-to-processing window
        finish_cancelled(&inner, &job_id, &work_dir).await;
        return;
    }

    // Clip stage. No clips means the fetched files go to storage as-is.
    let outputs = if request.clips.is_empty() {
        outcome.files.clone()
    } else {
        let media = match outcome.files.first() {
            Some(media) => media.clone(),
            None => {
                inner.fail_job(
                    &job_id,
                    &JobError::Internal("fetch produced no media file".to_string()),
                );
                return;
            }
        };
        match inner
            .extractor
            .extract(&media, &request.clips, &work_dir, cancel.clone())
            .await
        {
            Ok(report) => {
                for failure in &report.failures {
                    warn!(
                        "job {}: clip {} failed: {}",
                        job_id, failure.clip_id, failure.reason
                    );
                }
                if report.all_failed() {
                    inner.fail_job(
                        &job_id,
                        &JobError::Extraction(format!(
                            "all {} clips failed",
                            report.failures.len()
                        )),
                    );
                    return;
                }
                report.outputs
            }
            Err(ClipError::Cancelled) => {
                finish_cancelled(&inner, &job_id, &work_dir).await;
                return;
            }
            Err(ClipError::Merge(msg)) | Err(ClipError::IncompatibleInputs(msg)) => {
                inner.fail_job(&job_id, &JobError::Merge(msg));
                return;
            }
            Err(e) => {
                inner.fail_job(&job_id, &JobError::Extraction(e.to_string()));
                return;
            }
        }
    };

    if cancel.is_cancelled() {
        finish_cancelled(&inner, &job_id, &work_dir).await;
        return;
    }

    // Storage stage
    let sink = match inner.sinks.get(request.backend) {
        Some(sink) => sink,
        None => {
            inner.fail_job(
                &job_id,
                &JobError::Storage(format!("no sink registered for {:?}", request.backend)),
            );
            return;
        }
    };
    let locations = match sink.store(&outputs, request.target_path.as_deref()).await {
        Ok(locations) => locations,
        Err(e) => {
            inner.fail_job(&job_id, &JobError::Storage(e.to_string()));
            return;
        }
    };
    if locations.is_empty() {
        inner.fail_job(
            &job_id,
            &JobError::Storage("no files could be stored".to_string()),
        );
        return;
    }
    if locations.len() < outputs.len() {
        warn!(
            "job {}: stored {} of {} files",
            job_id,
            locations.len(),
            outputs.len()
        );
    }

    let output_files: Vec<String> = locations.into_iter().map(|l| l.uri).collect();
    let completed = {
        let mut entry = match inner.jobs.get_mut(&job_id) {
            Some(entry) => entry,
            None => return,
        };
        let job = entry.value_mut();
        if job.status.is_terminal() {
            false
        } else {
            job.status = JobStatus::Completed;
            job.completed_at = Some(Utc::now());
            job.output_files = output_files.clone();
            // Source metadata fills in what the request left unset
            for (key, value) in outcome.metadata {
                job.metadata.entry(key).or_insert(value);
            }
            true
        }
    };

    if completed {
        let _ = tokio::fs::remove_dir_all(&work_dir).await;
        info!("✅ Job {} completed ({} files)", job_id, output_files.len());
        inner.events.publish(JobEvent::Completed {
            job_id: job_id.clone(),
            output_files,
        });
    }
}

/// Partial files are removed before the job goes terminal.
async fn finish_cancelled(inner: &ManagerInner, job_id: &str, work_dir: &std::path::Path) {
    let _ = tokio::fs::remove_dir_all(work_dir).await;
    inner.cancel_job(job_id);
    debug!("job {} cancelled, work dir cleaned", job_id);
}
