//! HTTP object-store sink
//!
//! Uploads each file with a bearer-authenticated PUT to
//! `{endpoint}/{bucket}/{key}`. Transient failures (5xx, network) are
//! retried with backoff; 4xx responses are permanent.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{info, warn};
use url::Url;

use crate::core::config::ObjectStoreConfig;
use crate::core::error_handling::run_with_retry;
use crate::core::models::StorageBackend;

use super::{StorageError, StorageSink, StoredLocation};

pub struct ObjectStoreSink {
    client: reqwest::Client,
    config: ObjectStoreConfig,
}

impl ObjectStoreSink {
    pub fn new(client: reqwest::Client, config: ObjectStoreConfig) -> Self {
        Self { client, config }
    }

    /// Object key: `{target_path}/{file_name}` or just the file name.
    fn object_key(target_path: Option<&str>, file: &Path) -> Option<String> {
        let name = file.file_name()?.to_str()?;
        Some(match target_path {
            Some(prefix) => format!("{}/{}", prefix.trim_matches('/'), name),
            None => name.to_string(),
        })
    }

    fn object_url(&self, key: &str) -> Result<Url, StorageError> {
        let base = Url::parse(&self.config.endpoint)
            .map_err(|e| StorageError::Rejected(format!("bad endpoint: {}", e)))?;
        base.join(&format!("{}/{}", self.config.bucket, key))
            .map_err(|e| StorageError::Rejected(format!("bad object key {}: {}", key, e)))
    }

    async fn upload_once(&self, url: &Url, file: &Path) -> Result<(), StorageError> {
        let body = tokio::fs::read(file).await?;
        let response = self
            .client
            .put(url.clone())
            .bearer_auth(&self.config.access_token)
            .body(body)
            .send()
            .await
            .map_err(|e| StorageError::Upload(format!("request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_client_error() {
            Err(StorageError::Rejected(format!("HTTP {}", status)))
        } else {
            Err(StorageError::Upload(format!("HTTP {}", status)))
        }
    }
}

#[async_trait]
impl StorageSink for ObjectStoreSink {
    async fn store(
        &self,
        files: &[PathBuf],
        target_path: Option<&str>,
    ) -> Result<Vec<StoredLocation>, StorageError> {
        let mut locations = Vec::with_capacity(files.len());

        for file in files {
            let key = match Self::object_key(target_path, file) {
                Some(key) => key,
                None => {
                    warn!("skipping {}: unusable file name", file.display());
                    continue;
                }
            };
            let url = match self.object_url(&key) {
                Ok(url) => url,
                Err(e) => {
                    warn!("skipping {}: {}", file.display(), e);
                    continue;
                }
            };

            match run_with_retry(&self.config.retry, "object-store upload", || {
                self.upload_once(&url, file)
            })
            .await
            {
                Ok(()) => {
                    info!("uploaded {} -> {}", file.display(), url);
                    locations.push(StoredLocation {
                        uri: url.to_string(),
                        backend: StorageBackend::ObjectStore,
                    });
                }
                Err(e) => {
                    warn!("failed to upload {}: {}", file.display(), e);
                }
            }
        }

        Ok(locations)
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::ObjectStore
    }
}
