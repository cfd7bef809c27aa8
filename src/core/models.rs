//! Core data models for the clip download pipeline

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error_handling::JobError;

/// Job status enumeration
///
/// `Pending -> Downloading -> Processing -> Completed` is the success path;
/// `Failed` and `Cancelled` are reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Downloading,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// A job counts against the concurrency cap while active.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Downloading | Self::Processing)
    }
}

/// Storage backend selector
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Local,
    ObjectStore,
    CloudDrive,
}

impl Default for StorageBackend {
    fn default() -> Self {
        Self::Local
    }
}

/// Requested output container format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Mp4,
    Mkv,
    Webm,
    M4a,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Mkv => "mkv",
            Self::Webm => "webm",
            Self::M4a => "m4a",
        }
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::Mp4
    }
}

/// Quality tier for the fetched asset
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Best,
    High,
    Medium,
    Low,
    Worst,
}

impl Default for QualityTier {
    fn default() -> Self {
        Self::Best
    }
}

/// Subtitle download options
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubtitleOptions {
    pub include: bool,
    pub languages: Vec<String>,
}

/// One requested clip: a time-bounded cut out of the fetched asset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipRequest {
    /// Caller-supplied id, unique within the request
    pub id: String,
    /// Start offset in seconds, >= 0
    pub start_secs: f64,
    /// End offset in seconds, > start
    pub end_secs: f64,
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ClipRequest {
    pub fn duration_secs(&self) -> f64 {
        self.end_secs - self.start_secs
    }
}

/// Immutable description of one download job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Asset identifier (URL or platform-specific id, interpreted by the source)
    pub asset_id: String,
    /// Clips to cut out of the asset; empty means "whole asset"
    #[serde(default)]
    pub clips: Vec<ClipRequest>,
    #[serde(default)]
    pub format: OutputFormat,
    #[serde(default)]
    pub quality: QualityTier,
    #[serde(default)]
    pub subtitles: SubtitleOptions,
    #[serde(default)]
    pub backend: StorageBackend,
    /// Backend-specific target path; None lets the sink derive one
    pub target_path: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl DownloadRequest {
    /// Structural validation performed at submission time.
    ///
    /// A request failing here is rejected before any job is created.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.asset_id.trim().is_empty() {
            return Err(JobError::Validation("asset id must not be empty".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for clip in &self.clips {
            if clip.id.trim().is_empty() {
                return Err(JobError::Validation("clip id must not be empty".into()));
            }
            if !seen.insert(clip.id.as_str()) {
                return Err(JobError::Validation(format!(
                    "duplicate clip id: {}",
                    clip.id
                )));
            }
            if clip.start_secs < 0.0 {
                return Err(JobError::Validation(format!(
                    "clip {}: start offset must be >= 0 (got {})",
                    clip.id, clip.start_secs
                )));
            }
            if clip.end_secs <= clip.start_secs {
                return Err(JobError::Validation(format!(
                    "clip {}: end offset {} must be greater than start offset {}",
                    clip.id, clip.end_secs, clip.start_secs
                )));
            }
        }

        Ok(())
    }
}

/// Progress snapshot for a running fetch
///
/// Overwritten wholesale on every tick; never merged field by field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    /// Percentage in 0..=100
    pub percent: f64,
    /// Instantaneous speed in bytes per second
    pub speed_bps: Option<f64>,
    pub eta_secs: Option<u64>,
}

impl DownloadProgress {
    /// Build a snapshot from byte counts, deriving percent and ETA.
    pub fn from_bytes(downloaded: u64, total: Option<u64>, speed_bps: Option<f64>) -> Self {
        let percent = match total {
            Some(total) if total > 0 => (downloaded as f64 / total as f64 * 100.0).min(100.0),
            _ => 0.0,
        };
        let eta_secs = match (total, speed_bps) {
            (Some(total), Some(speed)) if speed > 0.0 && total > downloaded => {
                Some(((total - downloaded) as f64 / speed).ceil() as u64)
            }
            _ => None,
        };
        Self {
            downloaded_bytes: downloaded,
            total_bytes: total,
            percent,
            speed_bps,
            eta_secs,
        }
    }
}

/// The aggregate root: one end-to-end fetch/clip/store job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub asset_id: String,
    /// Immutable snapshot of the originating request
    pub request: DownloadRequest,
    pub status: JobStatus,
    pub progress: DownloadProgress,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Error message, set only when the job is Failed
    pub error: Option<String>,
    /// Final output locations; empty until the job completes
    pub output_files: Vec<String>,
    /// Request metadata merged with source-reported metadata on completion
    pub metadata: HashMap<String, String>,
}

impl Job {
    pub fn new(id: String, request: DownloadRequest) -> Self {
        let metadata = request.metadata.clone();
        Self {
            id,
            asset_id: request.asset_id.clone(),
            request,
            status: JobStatus::Pending,
            progress: DownloadProgress::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            output_files: Vec::new(),
            metadata,
        }
    }
}

/// Read-only snapshot of the scheduler queue, computed on demand
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub total_jobs: usize,
    pub pending_jobs: usize,
    pub active_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub queue_capacity: usize,
    /// Rough wait estimate: pending jobs / active workers * assumed job duration
    pub estimated_wait_secs: Option<u64>,
}
