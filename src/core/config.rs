//! Application configuration
//!
//! Nested sections with sensible defaults, JSON load/save, and validation at
//! construction. The host application decides where the file lives and hands
//! the path in.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::error_handling::RetryPolicy;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub ffmpeg: FfmpegConfig,
    #[serde(default)]
    pub ytdlp: YtdlpConfig,
    #[serde(default)]
    pub http: HttpSourceConfig,
    /// Object-store sink; absent means the backend is not configured
    #[serde(default)]
    pub object_store: Option<ObjectStoreConfig>,
    /// Cloud-drive sink; absent means the backend is not configured
    #[serde(default)]
    pub cloud_drive: Option<CloudDriveConfig>,
}

/// Scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Worker pool cap; jobs beyond this wait in the queue
    pub max_concurrent_downloads: usize,
    /// Bounded queue capacity; submissions beyond this fail with QueueFull
    pub queue_size_limit: usize,
    /// Root directory for per-job working directories
    pub work_dir: PathBuf,
    /// Average job duration assumed when estimating queue wait time
    pub assumed_job_duration_secs: u64,
    /// Broadcast channel capacity for job events
    pub event_channel_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
            queue_size_limit: 100,
            work_dir: PathBuf::from("./downloads"),
            assumed_job_duration_secs: 120,
            event_channel_capacity: 256,
        }
    }
}

/// ffmpeg / ffprobe settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FfmpegConfig {
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    /// Wall-clock limit for a single ffmpeg/ffprobe invocation
    pub timeout_secs: u64,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            timeout_secs: 600,
        }
    }
}

impl FfmpegConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// yt-dlp subprocess settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YtdlpConfig {
    pub binary_path: PathBuf,
    /// Extra arguments appended verbatim to every invocation
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for YtdlpConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("yt-dlp"),
            extra_args: Vec::new(),
        }
    }
}

/// Direct HTTP fetch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSourceConfig {
    pub user_agent: String,
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("clipfetch/{}", env!("CARGO_PKG_VERSION")),
            timeout_secs: 300,
            retry: RetryPolicy::default(),
        }
    }
}

/// Object-store upload sink settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_token: String,
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Cloud-drive upload sink settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudDriveConfig {
    pub endpoint: String,
    pub access_token: String,
    /// Remote folder the uploads land in
    pub folder: Option<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl AppConfig {
    /// Load from a JSON file, falling back to defaults if the file is missing.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save as pretty-printed JSON, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create config dir: {}", parent.display()))?;
        }
        let content =
            serde_json::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.manager.max_concurrent_downloads == 0 {
            anyhow::bail!("max_concurrent_downloads must be at least 1");
        }
        if self.manager.queue_size_limit == 0 {
            anyhow::bail!("queue_size_limit must be at least 1");
        }
        if self.ffmpeg.timeout_secs == 0 {
            anyhow::bail!("ffmpeg timeout_secs must be at least 1");
        }
        if let Some(store) = &self.object_store {
            if store.endpoint.trim().is_empty() || store.bucket.trim().is_empty() {
                anyhow::bail!("object_store endpoint and bucket must not be empty");
            }
        }
        if let Some(drive) = &self.cloud_drive {
            if drive.endpoint.trim().is_empty() {
                anyhow::bail!("cloud_drive endpoint must not be empty");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.manager.max_concurrent_downloads, 3);
        assert_eq!(config.manager.queue_size_limit, 100);
        assert!(config.object_store.is_none());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = AppConfig::default();
        config.manager.max_concurrent_downloads = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config.manager.queue_size_limit, 100);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.json");

        let mut config = AppConfig::default();
        config.manager.max_concurrent_downloads = 7;
        config.object_store = Some(ObjectStoreConfig {
            endpoint: "https://store.example.com".to_string(),
            bucket: "clips".to_string(),
            access_token: "token".to_string(),
            retry: RetryPolicy::default(),
        });
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.manager.max_concurrent_downloads, 7);
        assert_eq!(loaded.object_store.unwrap().bucket, "clips");
    }

    #[test]
    fn test_load_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"manager": {"max_concurrent_downloads": 0, "queue_size_limit": 10, "work_dir": "./d", "assumed_job_duration_secs": 60, "event_channel_capacity": 16}}"#,
        )
        .unwrap();
        assert!(AppConfig::load(&path).is_err());
    }
}
