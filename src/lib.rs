//! clipfetch - download job scheduler and media clip pipeline
//!
//! A bounded queue feeds a concurrency-capped worker pool; each worker drives
//! one job through fetch (HTTP or yt-dlp), clip extraction/merge (ffmpeg),
//! and storage persistence (local, object store, or cloud drive). Hosts embed
//! the [`core::DownloadManager`] and inject the collaborator traits
//! ([`source::MediaSource`], [`clip::ClipExtractor`], [`storage::StorageSink`])
//! with real or test implementations.

pub mod clip;
pub mod core;
pub mod source;
pub mod storage;
pub mod utils;

pub use crate::core::config::AppConfig;
pub use crate::core::error_handling::JobError;
pub use crate::core::events::JobEvent;
pub use crate::core::manager::DownloadManager;
pub use crate::core::models::{
    DownloadProgress, DownloadRequest, Job, JobStatus, QueueStatus, StorageBackend,
};

/// Initialize logging for binaries embedding this crate.
pub fn init_logging(default_level: &str) {
    utils::logging::init_tracing(default_level);
}
