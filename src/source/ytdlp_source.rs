//! yt-dlp subprocess fetch
//!
//! Runs the `yt-dlp` binary in two passes: a metadata probe (`-j`) and the
//! actual download with `--newline` so progress arrives one parseable line at
//! a time. The child process is killed promptly on cancellation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::YtdlpConfig;
use crate::core::models::{DownloadProgress, OutputFormat, QualityTier};

use super::{FetchOutcome, FetchSpec, MediaSource, ProgressFn, SourceError};

fn progress_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[download\]\s+([\d.]+)%\s+of\s+~?([\d.]+)(\w+)\s+at\s+([\d.]+)(\w+)/s")
            .expect("valid regex")
    })
}

fn progress_simple_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[download\]\s+([\d.]+)%").expect("valid regex"))
}

fn destination_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\[download\]\s+Destination:\s+(.+)|\[Merger\]\s+Merging formats into\s+"(.+)""#)
            .expect("valid regex")
    })
}

/// One parsed `--newline` progress tick
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ProgressTick {
    pub percent: f64,
    pub total_bytes: Option<u64>,
    pub speed_bps: Option<f64>,
}

/// Convert "150.00" + "MiB" style size fragments to bytes.
pub(crate) fn parse_size(value: &str, unit: &str) -> Option<u64> {
    let value: f64 = value.parse().ok()?;
    let multiplier: f64 = match unit {
        "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        _ => return None,
    };
    Some((value * multiplier) as u64)
}

/// Parse one stdout line into a progress tick, if it is one.
pub(crate) fn parse_progress_line(line: &str) -> Option<ProgressTick> {
    if let Some(caps) = progress_re().captures(line) {
        let percent: f64 = caps[1].parse().ok()?;
        let total_bytes = parse_size(&caps[2], &caps[3]);
        let speed_bps = parse_size(&caps[4], &caps[5]).map(|b| b as f64);
        return Some(ProgressTick {
            percent,
            total_bytes,
            speed_bps,
        });
    }

    // Bare percentage lines (e.g. at 100%) carry no size or speed
    let caps = progress_simple_re().captures(line)?;
    Some(ProgressTick {
        percent: caps[1].parse().ok()?,
        total_bytes: None,
        speed_bps: None,
    })
}

/// An output path named on stdout
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum OutputPathLine {
    /// `[download] Destination:` — an intermediate or final download target
    Destination(String),
    /// `[Merger] Merging formats into` — the final merged media file
    Merged(String),
}

/// Parse a destination or merger line into the output path it names.
pub(crate) fn parse_destination_line(line: &str) -> Option<OutputPathLine> {
    let caps = destination_re().captures(line)?;
    if let Some(m) = caps.get(2) {
        return Some(OutputPathLine::Merged(m.as_str().to_string()));
    }
    caps.get(1)
        .map(|m| OutputPathLine::Destination(m.as_str().to_string()))
}

/// Convert a progress tick into a progress snapshot. yt-dlp's own percentage
/// is authoritative; byte counts are derived from it when a total is known.
pub(crate) fn tick_to_progress(tick: &ProgressTick) -> DownloadProgress {
    let downloaded = tick
        .total_bytes
        .map(|t| (t as f64 * tick.percent / 100.0) as u64)
        .unwrap_or(0);
    let mut progress = DownloadProgress::from_bytes(downloaded, tick.total_bytes, tick.speed_bps);
    progress.percent = tick.percent.min(100.0);
    progress
}

/// Put the primary media file first: the merger output when one was
/// reported, otherwise the first file matching the requested container.
/// Subtitle files and other side outputs keep their relative order.
pub(crate) fn order_media_first(
    files: &mut Vec<PathBuf>,
    merged: Option<&Path>,
    format: OutputFormat,
) {
    let media_idx = files
        .iter()
        .position(|p| merged == Some(p.as_path()))
        .or_else(|| {
            files.iter().position(|p| {
                p.extension().and_then(|e| e.to_str()) == Some(format.extension())
            })
        });
    if let Some(idx) = media_idx {
        let media = files.remove(idx);
        files.insert(0, media);
    }
}

pub struct YtdlpSource {
    config: YtdlpConfig,
}

impl YtdlpSource {
    pub fn new(config: YtdlpConfig) -> Self {
        Self { config }
    }

    /// Map the quality tier onto a yt-dlp format selector.
    fn format_selector(quality: QualityTier, format: OutputFormat) -> String {
        if format == OutputFormat::M4a {
            return "bestaudio[ext=m4a]/bestaudio".to_string();
        }
        match quality {
            QualityTier::Best => "bestvideo+bestaudio/best".to_string(),
            QualityTier::High => "bestvideo[height<=1080]+bestaudio/best[height<=1080]".to_string(),
            QualityTier::Medium => "bestvideo[height<=720]+bestaudio/best[height<=720]".to_string(),
            QualityTier::Low => "bestvideo[height<=480]+bestaudio/best[height<=480]".to_string(),
            QualityTier::Worst => "worstvideo+worstaudio/worst".to_string(),
        }
    }

    /// Build the download invocation arguments. Pure, so it is testable
    /// without a binary on the path.
    pub(crate) fn build_download_args(&self, spec: &FetchSpec, work_dir: &Path) -> Vec<String> {
        let mut args = vec![
            "--newline".to_string(),
            "--no-playlist".to_string(),
            "-f".to_string(),
            Self::format_selector(spec.quality, spec.format),
            "-o".to_string(),
            work_dir
                .join("%(title)s.%(ext)s")
                .to_string_lossy()
                .into_owned(),
        ];

        match spec.format {
            OutputFormat::M4a => {
                args.push("-x".to_string());
                args.push("--audio-format".to_string());
                args.push("m4a".to_string());
            }
            other => {
                args.push("--merge-output-format".to_string());
                args.push(other.extension().to_string());
            }
        }

        if spec.subtitles.include {
            args.push("--write-subs".to_string());
            if !spec.subtitles.languages.is_empty() {
                args.push("--sub-langs".to_string());
                args.push(spec.subtitles.languages.join(","));
            }
        }

        args.extend(self.config.extra_args.iter().cloned());
        args.push(spec.asset_id.clone());
        args
    }

    /// Metadata pass: `yt-dlp -j` returns one JSON object describing the asset.
    async fn probe_metadata(
        &self,
        asset_id: &str,
    ) -> Result<HashMap<String, String>, SourceError> {
        let output = Command::new(&self.config.binary_path)
            .arg("-j")
            .arg("--no-playlist")
            .arg(asset_id)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| SourceError::Transfer(format!("failed to spawn yt-dlp: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr.lines().last().unwrap_or("unknown error").to_string();
            return Err(SourceError::Unavailable(format!(
                "{}: {}",
                asset_id, reason
            )));
        }

        let info: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| SourceError::Transfer(format!("bad metadata json: {}", e)))?;

        let mut metadata = HashMap::new();
        metadata.insert("source".to_string(), "yt-dlp".to_string());
        for key in ["title", "uploader", "id", "webpage_url"] {
            if let Some(value) = info.get(key).and_then(|v| v.as_str()) {
                metadata.insert(key.to_string(), value.to_string());
            }
        }
        if let Some(duration) = info.get("duration").and_then(|v| v.as_f64()) {
            metadata.insert("duration_secs".to_string(), duration.to_string());
        }
        Ok(metadata)
    }
}

#[async_trait]
impl MediaSource for YtdlpSource {
    async fn fetch(
        &self,
        spec: &FetchSpec,
        work_dir: &Path,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<FetchOutcome, SourceError> {
        let metadata = self.probe_metadata(&spec.asset_id).await?;
        info!(
            "yt-dlp fetching {} ({})",
            spec.asset_id,
            metadata.get("title").map(String::as_str).unwrap_or("?")
        );

        let args = self.build_download_args(spec, work_dir);
        let mut child = Command::new(&self.config.binary_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SourceError::Transfer(format!("failed to spawn yt-dlp: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SourceError::Transfer("yt-dlp stdout not captured".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let mut output_files: Vec<PathBuf> = Vec::new();
        let mut merged_file: Option<PathBuf> = None;

        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("yt-dlp fetch of {} cancelled, killing child", spec.asset_id);
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(SourceError::Cancelled);
                }
                line = lines.next_line() => line,
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => return Err(SourceError::Transfer(format!("stdout read error: {}", e))),
            };

            if let Some(tick) = parse_progress_line(&line) {
                progress(tick_to_progress(&tick));
            } else if let Some(dest) = parse_destination_line(&line) {
                let path = match dest {
                    OutputPathLine::Merged(path) => {
                        let path = PathBuf::from(path);
                        merged_file = Some(path.clone());
                        path
                    }
                    OutputPathLine::Destination(path) => PathBuf::from(path),
                };
                debug!("yt-dlp writing to {}", path.display());
                if !output_files.contains(&path) {
                    output_files.push(path);
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| SourceError::Transfer(format!("yt-dlp wait failed: {}", e)))?;
        if !status.success() {
            return Err(SourceError::Transfer(format!(
                "yt-dlp exited with {}",
                status
            )));
        }

        // A merge pass replaces intermediate destination files; keep only the
        // ones that still exist, newest-named last wins.
        output_files.retain(|p| p.exists());
        if output_files.is_empty() {
            // Fall back to scanning the work dir for whatever yt-dlp produced.
            let mut entries = tokio::fs::read_dir(work_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_file() {
                    output_files.push(entry.path());
                }
            }
        }
        if output_files.is_empty() {
            return Err(SourceError::Transfer(
                "yt-dlp reported success but produced no files".to_string(),
            ));
        }
        // Subtitle destinations can precede the media file on stdout; callers
        // rely on the media file coming first.
        order_media_first(&mut output_files, merged_file.as_deref(), spec.format);

        Ok(FetchOutcome {
            files: output_files,
            metadata,
        })
    }
}
