//! Mock collaborators for scheduler tests

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::clip::{ClipError, ClipExtractor, ClipFailure, ExtractReport, MediaInfo};
use crate::core::models::{ClipRequest, DownloadProgress, StorageBackend};
use crate::source::{FetchOutcome, FetchSpec, MediaSource, ProgressFn, SourceError};
use crate::storage::{StorageError, StorageSink, StoredLocation};

/// Scripted media source. Tracks concurrent fetches so tests can assert the
/// worker-pool cap.
pub struct MockSource {
    pub delay: Duration,
    pub fail_with: Option<SourceError>,
    /// Blocks until cancelled instead of completing
    pub hold_until_cancelled: bool,
    active: AtomicUsize,
    peak: Arc<AtomicUsize>,
}

impl MockSource {
    pub fn new() -> Self {
        Self {
            delay: Duration::from_millis(10),
            fail_with: None,
            hold_until_cancelled: false,
            active: AtomicUsize::new(0),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self, error: SourceError) -> Self {
        self.fail_with = Some(error);
        self
    }

    pub fn holding(mut self) -> Self {
        self.hold_until_cancelled = true;
        self
    }

    /// Highest number of fetches observed running at once.
    pub fn peak_concurrency(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.peak)
    }
}

#[async_trait]
impl MediaSource for MockSource {
    async fn fetch(
        &self,
        spec: &FetchSpec,
        work_dir: &Path,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<FetchOutcome, SourceError> {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_active, Ordering::SeqCst);

        let result = async {
            progress(DownloadProgress::from_bytes(0, Some(100), None));

            if self.hold_until_cancelled {
                cancel.cancelled().await;
                return Err(SourceError::Cancelled);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(SourceError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }

            if let Some(error) = &self.fail_with {
                return Err(error.clone());
            }

            let file = work_dir.join("media.mp4");
            tokio::fs::write(&file, b"mock media").await?;
            progress(DownloadProgress::from_bytes(100, Some(100), None));

            let mut metadata = HashMap::new();
            metadata.insert("title".to_string(), format!("mock {}", spec.asset_id));
            Ok(FetchOutcome {
                files: vec![file],
                metadata,
            })
        }
        .await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Extractor that succeeds for every clip except the scripted ids.
pub struct MockExtractor {
    pub failing_clips: HashSet<String>,
}

impl MockExtractor {
    pub fn new() -> Self {
        Self {
            failing_clips: HashSet::new(),
        }
    }

    pub fn failing_clip(mut self, clip_id: &str) -> Self {
        self.failing_clips.insert(clip_id.to_string());
        self
    }
}

#[async_trait]
impl ClipExtractor for MockExtractor {
    async fn extract(
        &self,
        _input: &Path,
        clips: &[ClipRequest],
        out_dir: &Path,
        cancel: CancellationToken,
    ) -> Result<ExtractReport, ClipError> {
        if cancel.is_cancelled() {
            return Err(ClipError::Cancelled);
        }

        let mut report = ExtractReport::default();
        for clip in clips {
            if self.failing_clips.contains(&clip.id) {
                report.failures.push(ClipFailure {
                    clip_id: clip.id.clone(),
                    reason: "scripted failure".to_string(),
                });
            } else {
                let output = out_dir.join(format!("{}.mp4", clip.id));
                tokio::fs::write(&output, b"clip").await?;
                report.outputs.push(output);
            }
        }
        Ok(report)
    }

    async fn merge(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        _cancel: CancellationToken,
    ) -> Result<PathBuf, ClipError> {
        if inputs.is_empty() {
            return Err(ClipError::Merge("no inputs".to_string()));
        }
        tokio::fs::write(output, b"merged").await?;
        Ok(output.to_path_buf())
    }

    async fn probe(&self, _input: &Path) -> Result<MediaInfo, ClipError> {
        Ok(MediaInfo {
            duration_secs: 60.0,
            width: Some(1280),
            height: Some(720),
            codec: Some("h264".to_string()),
            container: "mp4".to_string(),
        })
    }
}

/// Sink that records stored file names instead of touching a real backend.
pub struct RecordingSink {
    pub stored: parking_lot::Mutex<Vec<String>>,
    backend: StorageBackend,
}

impl RecordingSink {
    pub fn new(backend: StorageBackend) -> Self {
        Self {
            stored: parking_lot::Mutex::new(Vec::new()),
            backend,
        }
    }
}

#[async_trait]
impl StorageSink for RecordingSink {
    async fn store(
        &self,
        files: &[PathBuf],
        _target_path: Option<&str>,
    ) -> Result<Vec<StoredLocation>, StorageError> {
        let mut locations = Vec::new();
        for file in files {
            if let Some(name) = file.file_name().and_then(|n| n.to_str()) {
                let uri = format!("mock://{}", name);
                self.stored.lock().push(uri.clone());
                locations.push(StoredLocation {
                    uri,
                    backend: self.backend,
                });
            }
        }
        Ok(locations)
    }

    fn backend(&self) -> StorageBackend {
        self.backend
    }
}
