//! Media acquisition stage
//!
//! A `MediaSource` turns an asset identifier into local files inside the
//! job's working directory, reporting progress through a callback and
//! honoring cooperative cancellation. Transient transfer failures are
//! retried inside implementations; the scheduler never retries.

pub mod http_source;
pub mod ytdlp_source;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::error_handling::Retryable;
use crate::core::models::{DownloadProgress, OutputFormat, QualityTier, SubtitleOptions};

pub use http_source::HttpSource;
pub use ytdlp_source::YtdlpSource;

/// Progress callback invoked at a bounded interval during a fetch
pub type ProgressFn = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

/// What to fetch, distilled from the originating request
#[derive(Debug, Clone)]
pub struct FetchSpec {
    pub asset_id: String,
    pub quality: QualityTier,
    pub format: OutputFormat,
    pub subtitles: SubtitleOptions,
}

/// Result of a successful fetch
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    /// Local files written into the work dir; the media file comes first
    pub files: Vec<PathBuf>,
    /// Source-reported metadata (title, uploader, duration, ...)
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// Asset does not exist or access was denied; retrying will not help
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// Transient network or payload failure
    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("fetch cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(String),
}

impl Retryable for SourceError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transfer(_))
    }
}

impl From<std::io::Error> for SourceError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Acquires media for one job
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn fetch(
        &self,
        spec: &FetchSpec,
        work_dir: &Path,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<FetchOutcome, SourceError>;
}
