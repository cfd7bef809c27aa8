//! Local filesystem sink

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::core::models::StorageBackend;
use crate::utils::file_utils::ensure_dir_exists;

use super::{StorageError, StorageSink, StoredLocation};

/// Copies output files into a directory under a configured root.
pub struct LocalSink {
    root: PathBuf,
}

impl LocalSink {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Destination directory: the target path when given, otherwise a
    /// timestamp-derived subdirectory so repeated jobs never collide.
    fn dest_dir(&self, target_path: Option<&str>) -> PathBuf {
        match target_path {
            Some(target) => self.root.join(target),
            None => self
                .root
                .join(Utc::now().format("%Y%m%d-%H%M%S").to_string()),
        }
    }
}

#[async_trait]
impl StorageSink for LocalSink {
    async fn store(
        &self,
        files: &[PathBuf],
        target_path: Option<&str>,
    ) -> Result<Vec<StoredLocation>, StorageError> {
        let dest_dir = self.dest_dir(target_path);
        ensure_dir_exists(&dest_dir).map_err(|e| StorageError::Rejected(e.to_string()))?;

        let mut locations = Vec::with_capacity(files.len());
        for file in files {
            let name = match file.file_name() {
                Some(name) => name,
                None => {
                    warn!("skipping {}: no file name", file.display());
                    continue;
                }
            };
            let dest = dest_dir.join(name);
            match tokio::fs::copy(file, &dest).await {
                Ok(bytes) => {
                    info!("stored {} ({} bytes)", dest.display(), bytes);
                    locations.push(StoredLocation {
                        uri: dest.to_string_lossy().into_owned(),
                        backend: StorageBackend::Local,
                    });
                }
                Err(e) => {
                    warn!("failed to store {}: {}", file.display(), e);
                }
            }
        }
        Ok(locations)
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::Local
    }
}
