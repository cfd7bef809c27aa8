//! Job lifecycle events
//!
//! Workers publish into a broadcast channel; any number of consumers can
//! subscribe via `DownloadManager::subscribe`. Sends are best-effort: a lagging
//! or absent subscriber never blocks a worker.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::core::models::{DownloadProgress, Job, JobStatus};

/// Events emitted over the lifetime of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// A new job entered the registry (possibly already Failed on queue-full)
    Submitted { job: Job },
    StatusChanged { job_id: String, status: JobStatus },
    Progress {
        job_id: String,
        progress: DownloadProgress,
    },
    Completed {
        job_id: String,
        output_files: Vec<String>,
    },
    Failed { job_id: String, error: String },
    Cancelled { job_id: String },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Submitted { job } => &job.id,
            Self::StatusChanged { job_id, .. }
            | Self::Progress { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Cancelled { job_id } => job_id,
        }
    }
}

/// Thin wrapper around the broadcast sender so workers can publish without
/// caring whether anyone is listening.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Errors (no active subscribers) are ignored.
    pub fn publish(&self, event: JobEvent) {
        trace!("event for job {}: publishing", event.job_id());
        let _ = self.sender.send(event);
    }
}
