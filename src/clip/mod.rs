//! Clip extraction and merge stage
//!
//! A `ClipExtractor` trims time ranges out of a fetched media file and can
//! concatenate the results. One clip failing never aborts the remaining
//! clips; the report carries successes and failures side by side.

pub mod ffmpeg;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::models::ClipRequest;

pub use ffmpeg::FfmpegClipExtractor;

/// Probe result: read-only facts about a media file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaInfo {
    pub duration_secs: f64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub codec: Option<String>,
    pub container: String,
}

#[derive(Debug, Clone, Error)]
pub enum ClipError {
    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("merge failed: {0}")]
    Merge(String),

    /// Inputs cannot be concatenated as-is (container or codec mismatch)
    #[error("incompatible inputs: {0}")]
    IncompatibleInputs(String),

    #[error("probe failed: {0}")]
    Probe(String),

    /// Invocation exceeded the configured wall-clock limit
    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ClipError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// One clip that could not be extracted
#[derive(Debug, Clone)]
pub struct ClipFailure {
    pub clip_id: String,
    pub reason: String,
}

/// Outcome of an extract pass: successes and failures side by side
#[derive(Debug, Clone, Default)]
pub struct ExtractReport {
    pub outputs: Vec<PathBuf>,
    pub failures: Vec<ClipFailure>,
}

impl ExtractReport {
    pub fn all_failed(&self) -> bool {
        self.outputs.is_empty() && !self.failures.is_empty()
    }
}

/// Trims and concatenates media files
#[async_trait]
pub trait ClipExtractor: Send + Sync {
    /// Extract every requested clip from `input`. Clips fail independently;
    /// the report carries both outputs and per-clip failures.
    async fn extract(
        &self,
        input: &std::path::Path,
        clips: &[ClipRequest],
        out_dir: &std::path::Path,
        cancel: CancellationToken,
    ) -> Result<ExtractReport, ClipError>;

    /// Concatenate `inputs` in order into a single file. A single input
    /// degrades to a plain copy.
    async fn merge(
        &self,
        inputs: &[PathBuf],
        output: &std::path::Path,
        cancel: CancellationToken,
    ) -> Result<PathBuf, ClipError>;

    /// Inspect a media file without modifying it.
    async fn probe(&self, input: &std::path::Path) -> Result<MediaInfo, ClipError>;
}
