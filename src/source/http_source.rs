//! Direct HTTP fetch
//!
//! Streams the response body to disk chunk by chunk, reporting progress at a
//! bounded interval and checking the cancellation token between chunks.
//! Transient failures are retried with backoff; each attempt restarts the
//! file from scratch.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Result;
use futures_util::StreamExt;
use reqwest::StatusCode;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::core::config::HttpSourceConfig;
use crate::core::error_handling::run_with_retry;
use crate::core::models::DownloadProgress;
use crate::utils::file_utils::sanitize_filename;

use super::{FetchOutcome, FetchSpec, MediaSource, ProgressFn, SourceError};

const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

pub struct HttpSource {
    client: reqwest::Client,
    config: HttpSourceConfig,
}

impl HttpSource {
    pub fn new(config: HttpSourceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    /// Derive the output filename from the URL path, falling back to the
    /// requested container format when the URL has no usable name.
    fn output_path(&self, spec: &FetchSpec, work_dir: &Path) -> PathBuf {
        let name = url::Url::parse(&spec.asset_id)
            .ok()
            .and_then(|u| {
                u.path_segments()
                    .and_then(|segments| segments.last().map(|s| s.to_string()))
            })
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("download.{}", spec.format.extension()));
        work_dir.join(sanitize_filename(&name))
    }

    async fn download_once(
        &self,
        url: &str,
        dest: &Path,
        progress: &ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<u64, SourceError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SourceError::Transfer(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(match status {
                StatusCode::NOT_FOUND | StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED | StatusCode::GONE => {
                    SourceError::Unavailable(format!("{}: HTTP {}", url, status))
                }
                _ => SourceError::Transfer(format!("{}: HTTP {}", url, status)),
            });
        }

        let total_bytes = response.content_length();
        let mut file = File::create(dest).await?;
        let mut stream = response.bytes_stream();

        let started = Instant::now();
        let mut last_tick = Instant::now();
        let mut downloaded: u64 = 0;

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("download of {} cancelled mid-stream", url);
                    return Err(SourceError::Cancelled);
                }
                chunk = stream.next() => chunk,
            };

            let chunk = match chunk {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    return Err(SourceError::Transfer(format!("stream error: {}", e)))
                }
                None => break,
            };

            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            if last_tick.elapsed() >= PROGRESS_INTERVAL {
                last_tick = Instant::now();
                let speed = downloaded as f64 / started.elapsed().as_secs_f64().max(0.001);
                progress(DownloadProgress::from_bytes(
                    downloaded,
                    total_bytes,
                    Some(speed),
                ));
            }
        }

        file.flush().await?;

        if let Some(total) = total_bytes {
            if downloaded != total {
                return Err(SourceError::Transfer(format!(
                    "size mismatch: expected {} bytes, got {}",
                    total, downloaded
                )));
            }
        }

        progress(DownloadProgress::from_bytes(downloaded, total_bytes, None));
        Ok(downloaded)
    }
}

#[async_trait]
impl MediaSource for HttpSource {
    async fn fetch(
        &self,
        spec: &FetchSpec,
        work_dir: &Path,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<FetchOutcome, SourceError> {
        let dest = self.output_path(spec, work_dir);
        info!("fetching {} -> {}", spec.asset_id, dest.display());

        let bytes = run_with_retry(&self.config.retry, "http fetch", || {
            self.download_once(&spec.asset_id, &dest, &progress, &cancel)
        })
        .await
        .map_err(|e| {
            if !matches!(e, SourceError::Cancelled) {
                warn!("fetch of {} failed: {}", spec.asset_id, e);
            }
            e
        })?;

        debug!("fetched {} ({} bytes)", spec.asset_id, bytes);

        let mut outcome = FetchOutcome {
            files: vec![dest],
            ..Default::default()
        };
        outcome
            .metadata
            .insert("source".to_string(), "http".to_string());
        outcome
            .metadata
            .insert("size_bytes".to_string(), bytes.to_string());
        Ok(outcome)
    }
}
