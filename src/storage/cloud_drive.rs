//! Cloud-drive upload sink
//!
//! Multipart POST per file against a drive-style upload endpoint; the
//! response JSON names the shareable URL of the uploaded file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};
use url::Url;

use crate::core::config::CloudDriveConfig;
use crate::core::error_handling::run_with_retry;
use crate::core::models::StorageBackend;

use super::{StorageError, StorageSink, StoredLocation};

#[derive(Debug, Deserialize)]
struct UploadResponse {
    url: String,
}

pub struct CloudDriveSink {
    client: reqwest::Client,
    config: CloudDriveConfig,
}

impl CloudDriveSink {
    pub fn new(client: reqwest::Client, config: CloudDriveConfig) -> Self {
        Self { client, config }
    }

    fn upload_url(&self) -> Result<Url, StorageError> {
        Url::parse(&self.config.endpoint)
            .map_err(|e| StorageError::Rejected(format!("bad endpoint: {}", e)))
    }

    /// Remote folder: explicit target path wins over the configured default.
    fn folder<'a>(&'a self, target_path: Option<&'a str>) -> Option<&'a str> {
        target_path.or(self.config.folder.as_deref())
    }

    async fn upload_once(
        &self,
        url: &Url,
        file: &Path,
        name: &str,
        folder: Option<&str>,
    ) -> Result<String, StorageError> {
        let body = tokio::fs::read(file).await?;
        let part = reqwest::multipart::Part::bytes(body).file_name(name.to_string());
        let mut form = reqwest::multipart::Form::new().part("file", part);
        if let Some(folder) = folder {
            form = form.text("folder", folder.to_string());
        }

        let response = self
            .client
            .post(url.clone())
            .bearer_auth(&self.config.access_token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| StorageError::Upload(format!("request failed: {}", e)))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(StorageError::Rejected(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(StorageError::Upload(format!("HTTP {}", status)));
        }

        let parsed: UploadResponse = response
            .json()
            .await
            .map_err(|e| StorageError::Upload(format!("bad upload response: {}", e)))?;
        Ok(parsed.url)
    }
}

#[async_trait]
impl StorageSink for CloudDriveSink {
    async fn store(
        &self,
        files: &[PathBuf],
        target_path: Option<&str>,
    ) -> Result<Vec<StoredLocation>, StorageError> {
        let url = self.upload_url()?;
        let folder = self.folder(target_path);
        let mut locations = Vec::with_capacity(files.len());

        for file in files {
            let name = match file.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => {
                    warn!("skipping {}: unusable file name", file.display());
                    continue;
                }
            };

            match run_with_retry(&self.config.retry, "cloud-drive upload", || {
                self.upload_once(&url, file, &name, folder)
            })
            .await
            {
                Ok(remote_url) => {
                    info!("uploaded {} -> {}", file.display(), remote_url);
                    locations.push(StoredLocation {
                        uri: remote_url,
                        backend: StorageBackend::CloudDrive,
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
        StorageBackend::CloudDrive
    }
}
