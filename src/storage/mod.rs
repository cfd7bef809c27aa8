//! Storage persistence stage
//!
//! One `StorageSink` per backend behind a common trait, selected through the
//! `SinkRegistry` so the scheduler never branches on backend kind. A sink
//! stores as many files as it can; per-file failures are logged and skipped,
//! and callers detect partial failure by comparing counts.

pub mod cloud_drive;
pub mod local;
pub mod object_store;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::error_handling::Retryable;
use crate::core::models::StorageBackend;

pub use cloud_drive::CloudDriveSink;
pub use local::LocalSink;
pub use object_store::ObjectStoreSink;

/// Where a stored file ended up
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredLocation {
    /// Addressable location: a filesystem path or a URL
    pub uri: String,
    pub backend: StorageBackend,
}

#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// Transient backend failure, worth retrying
    #[error("upload failed: {0}")]
    Upload(String),

    /// Permanent failure (bad credentials, missing bucket, invalid path)
    #[error("storage rejected request: {0}")]
    Rejected(String),

    #[error("io error: {0}")]
    Io(String),
}

impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Upload(_))
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Persists finished output files to one backend
#[async_trait]
pub trait StorageSink: Send + Sync {
    /// Store `files` under `target_path` (backend-specific meaning; None lets
    /// the sink derive a path). Returns the locations of the files that were
    /// stored; fewer locations than files means some were skipped.
    async fn store(
        &self,
        files: &[PathBuf],
        target_path: Option<&str>,
    ) -> Result<Vec<StoredLocation>, StorageError>;

    fn backend(&self) -> StorageBackend;
}

/// Maps a backend selector to its sink
#[derive(Default)]
pub struct SinkRegistry {
    sinks: HashMap<StorageBackend, Arc<dyn StorageSink>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, sink: Arc<dyn StorageSink>) {
        self.sinks.insert(sink.backend(), sink);
    }

    pub fn get(&self, backend: StorageBackend) -> Option<Arc<dyn StorageSink>> {
        self.sinks.get(&backend).cloned()
    }
}
