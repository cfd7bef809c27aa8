//! ffmpeg-backed clip extractor
//!
//! Trims are stream copies (`-c copy`), so cut points land on keyframes and
//! no re-encode happens. Every invocation runs under a wall-clock timeout and
//! the child is killed on cancellation or drop.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::FfmpegConfig;
use crate::core::models::ClipRequest;
use crate::utils::file_utils::sanitize_filename;

use super::{ClipError, ClipExtractor, ClipFailure, ExtractReport, MediaInfo};

/// Deterministic output name for a clip: its id plus the input's extension.
pub(crate) fn clip_output_name(clip: &ClipRequest, input: &Path) -> String {
    let ext = input
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("mp4");
    format!("{}.{}", sanitize_filename(&clip.id), ext)
}

/// Escape a path for an ffmpeg concat list entry (single quotes around the
/// path, embedded quotes as `'\''`).
pub(crate) fn concat_list_entry(path: &Path) -> String {
    let escaped = path.to_string_lossy().replace('\'', r"'\''");
    format!("file '{}'", escaped)
}

/// Concat demuxer list file content. Input order is concatenation order.
pub(crate) fn build_concat_list(inputs: &[PathBuf]) -> String {
    let mut list = String::new();
    for input in inputs {
        list.push_str(&concat_list_entry(input));
        list.push('\n');
    }
    list
}

/// Extract the fields we care about from `ffprobe -print_format json` output.
pub(crate) fn parse_probe_output(json: &str) -> Result<MediaInfo, ClipError> {
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| ClipError::Probe(format!("bad json: {}", e)))?;

    let format = value
        .get("format")
        .ok_or_else(|| ClipError::Probe("missing format section".to_string()))?;
    let duration_secs = format
        .get("duration")
        .and_then(|d| d.as_str())
        .and_then(|d| d.parse::<f64>().ok())
        .ok_or_else(|| ClipError::Probe("missing or unparseable duration".to_string()))?;
    let container = format
        .get("format_name")
        .and_then(|n| n.as_str())
        .unwrap_or("unknown")
        .to_string();

    let video_stream = value
        .get("streams")
        .and_then(|s| s.as_array())
        .and_then(|streams| {
            streams.iter().find(|s| {
                s.get("codec_type").and_then(|t| t.as_str()) == Some("video")
            })
        });

    Ok(MediaInfo {
        duration_secs,
        width: video_stream
            .and_then(|s| s.get("width"))
            .and_then(|w| w.as_u64())
            .map(|w| w as u32),
        height: video_stream
            .and_then(|s| s.get("height"))
            .and_then(|h| h.as_u64())
            .map(|h| h as u32),
        codec: video_stream
            .and_then(|s| s.get("codec_name"))
            .and_then(|c| c.as_str())
            .map(|c| c.to_string()),
        container,
    })
}

enum RunFailure {
    Timeout(u64),
    Cancelled,
    Exited(String),
    Spawn(String),
}

pub struct FfmpegClipExtractor {
    config: FfmpegConfig,
}

impl FfmpegClipExtractor {
    pub fn new(config: FfmpegConfig) -> Self {
        Self { config }
    }

    /// Arguments for a single stream-copy trim.
    pub(crate) fn extract_args(input: &Path, clip: &ClipRequest, output: &Path) -> Vec<String> {
        vec![
            "-nostdin".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-ss".to_string(),
            format!("{:.3}", clip.start_secs),
            "-i".to_string(),
            input.to_string_lossy().into_owned(),
            "-t".to_string(),
            format!("{:.3}", clip.duration_secs()),
            "-c".to_string(),
            "copy".to_string(),
            "-avoid_negative_ts".to_string(),
            "make_zero".to_string(),
            output.to_string_lossy().into_owned(),
        ]
    }

    /// Run ffmpeg to completion under the configured timeout, killing it on
    /// cancellation. Stderr is collected for the failure message.
    async fn run_ffmpeg(&self, args: &[String], cancel: &CancellationToken) -> Result<(), RunFailure> {
        debug!("ffmpeg {}", args.join(" "));
        let mut child = Command::new(&self.config.ffmpeg_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunFailure::Spawn(format!("failed to spawn ffmpeg: {}", e)))?;

        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut stderr) = stderr {
                use tokio::io::AsyncReadExt;
                let _ = stderr.read_to_end(&mut buf).await;
            }
            String::from_utf8_lossy(&buf).into_owned()
        });

        let timeout_secs = self.config.timeout_secs;
        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(RunFailure::Cancelled);
            }
            result = tokio::time::timeout(self.config.timeout(), child.wait()) => match result {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => return Err(RunFailure::Spawn(format!("ffmpeg wait failed: {}", e))),
                Err(_) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(RunFailure::Timeout(timeout_secs));
                }
            },
        };

        if status.success() {
            Ok(())
        } else {
            let stderr = stderr_task.await.unwrap_or_default();
            let reason = stderr.lines().last().unwrap_or("unknown error").to_string();
            Err(RunFailure::Exited(format!(
                "ffmpeg exited with {}: {}",
                status, reason
            )))
        }
    }
}

#[async_trait]
impl ClipExtractor for FfmpegClipExtractor {
    async fn extract(
        &self,
        input: &Path,
        clips: &[ClipRequest],
        out_dir: &Path,
        cancel: CancellationToken,
    ) -> Result<ExtractReport, ClipError> {
        let mut report = ExtractReport::default();

        for clip in clips {
            let output = out_dir.join(clip_output_name(clip, input));
            if output.exists() {
                report.failures.push(ClipFailure {
                    clip_id: clip.id.clone(),
                    reason: format!("output already exists: {}", output.display()),
                });
                continue;
            }

            let args = Self::extract_args(input, clip, &output);
            match self.run_ffmpeg(&args, &cancel).await {
                Ok(()) => {
                    info!(
                        "extracted clip {} ({:.1}s-{:.1}s)",
                        clip.id, clip.start_secs, clip.end_secs
                    );
                    report.outputs.push(output);
                }
                Err(RunFailure::Cancelled) => return Err(ClipError::Cancelled),
                Err(RunFailure::Timeout(secs)) => {
                    warn!("clip {} timed out after {}s", clip.id, secs);
                    report.failures.push(ClipFailure {
                        clip_id: clip.id.clone(),
                        reason: format!("timed out after {}s", secs),
                    });
                }
                Err(RunFailure::Exited(reason)) | Err(RunFailure::Spawn(reason)) => {
                    warn!("clip {} failed: {}", clip.id, reason);
                    report.failures.push(ClipFailure {
                        clip_id: clip.id.clone(),
                        reason,
                    });
                }
            }
        }

        Ok(report)
    }

    async fn merge(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        cancel: CancellationToken,
    ) -> Result<PathBuf, ClipError> {
        if inputs.is_empty() {
            return Err(ClipError::Merge("no inputs to merge".to_string()));
        }

        if inputs.len() == 1 {
            tokio::fs::copy(&inputs[0], output).await?;
            return Ok(output.to_path_buf());
        }

        let first_ext = inputs[0].extension().map(|e| e.to_os_string());
        for input in &inputs[1..] {
            if input.extension().map(|e| e.to_os_string()) != first_ext {
                return Err(ClipError::IncompatibleInputs(format!(
                    "container mismatch: {} vs {}",
                    inputs[0].display(),
                    input.display()
                )));
            }
        }

        let list_path = output.with_extension("concat.txt");
        let mut list = tokio::fs::File::create(&list_path).await?;
        list.write_all(build_concat_list(inputs).as_bytes()).await?;
        list.flush().await?;

        let args = vec![
            "-nostdin".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-f".to_string(),
            "concat".to_string(),
            "-safe".to_string(),
            "0".to_string(),
            "-i".to_string(),
            list_path.to_string_lossy().into_owned(),
            "-c".to_string(),
            "copy".to_string(),
            output.to_string_lossy().into_owned(),
        ];

        let result = self.run_ffmpeg(&args, &cancel).await;
        let _ = tokio::fs::remove_file(&list_path).await;

        match result {
            Ok(()) => Ok(output.to_path_buf()),
            Err(RunFailure::Cancelled) => Err(ClipError::Cancelled),
            Err(RunFailure::Timeout(secs)) => Err(ClipError::Timeout { secs }),
            Err(RunFailure::Exited(reason)) | Err(RunFailure::Spawn(reason)) => {
                Err(ClipError::Merge(reason))
            }
        }
    }

    async fn probe(&self, input: &Path) -> Result<MediaInfo, ClipError> {
        let output = Command::new(&self.config.ffprobe_path)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(input)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ClipError::Probe(format!("failed to spawn ffprobe: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ClipError::Probe(format!(
                "ffprobe exited with {}: {}",
                output.status,
                stderr.lines().last().unwrap_or("unknown error")
            )));
        }

        parse_probe_output(&String::from_utf8_lossy(&output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn clip(id: &str, start: f64, end: f64) -> ClipRequest {
        ClipRequest {
            id: id.to_string(),
            start_secs: start,
            end_secs: end,
            title: None,
            description: None,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_clip_output_name_uses_id_and_input_extension() {
        let c = clip("intro", 0.0, 10.0);
        assert_eq!(clip_output_name(&c, Path::new("/work/video.mkv")), "intro.mkv");
        assert_eq!(clip_output_name(&c, Path::new("/work/noext")), "intro.mp4");
    }

    #[test]
    fn test_clip_output_name_sanitizes_id() {
        let c = clip("part/one:two", 0.0, 5.0);
        assert_eq!(clip_output_name(&c, Path::new("v.mp4")), "part_one_two.mp4");
    }

    #[test]
    fn test_extract_args_order() {
        let c = clip("c1", 12.5, 42.0);
        let args = FfmpegClipExtractor::extract_args(Path::new("/w/in.mp4"), &c, Path::new("/w/c1.mp4"));

        let ss = args.iter().position(|a| a == "-ss").unwrap();
        let i = args.iter().position(|a| a == "-i").unwrap();
        let t = args.iter().position(|a| a == "-t").unwrap();
        // -ss before -i gives fast keyframe seeking
        assert!(ss < i);
        assert_eq!(args[ss + 1], "12.500");
        assert_eq!(args[t + 1], "29.500");
        assert!(args.contains(&"copy".to_string()));
        assert_eq!(args.last().unwrap(), "/w/c1.mp4");
    }

    #[test]
    fn test_concat_list_preserves_input_order() {
        let list = build_concat_list(&[
            PathBuf::from("/work/a.mp4"),
            PathBuf::from("/work/b.mp4"),
            PathBuf::from("/work/c.mp4"),
        ]);

        // Concatenation order follows list order
        assert_eq!(
            list,
            "file '/work/a.mp4'\nfile '/work/b.mp4'\nfile '/work/c.mp4'\n"
        );
    }

    #[test]
    fn test_concat_list_entry_escapes_quotes() {
        assert_eq!(
            concat_list_entry(Path::new("/work/a.mp4")),
            "file '/work/a.mp4'"
        );
        assert_eq!(
            concat_list_entry(Path::new("/work/it's.mp4")),
            r"file '/work/it'\''s.mp4'"
        );
    }

    #[test]
    fn test_parse_probe_output() {
        let json = r#"{
            "streams": [
                {"codec_type": "audio", "codec_name": "aac"},
                {"codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080}
            ],
            "format": {"format_name": "mov,mp4,m4a,3gp,3g2,mj2", "duration": "633.530000"}
        }"#;

        let info = parse_probe_output(json).unwrap();
        assert!((info.duration_secs - 633.53).abs() < 0.001);
        assert_eq!(info.width, Some(1920));
        assert_eq!(info.height, Some(1080));
        assert_eq!(info.codec.as_deref(), Some("h264"));
        assert!(info.container.contains("mp4"));
    }

    #[test]
    fn test_parse_probe_output_audio_only() {
        let json = r#"{
            "streams": [{"codec_type": "audio", "codec_name": "aac"}],
            "format": {"format_name": "m4a", "duration": "120.0"}
        }"#;

        let info = parse_probe_output(json).unwrap();
        assert_eq!(info.width, None);
        assert_eq!(info.codec, None);
    }

    #[test]
    fn test_parse_probe_output_missing_duration() {
        let json = r#"{"format": {"format_name": "mp4"}}"#;
        assert!(matches!(parse_probe_output(json), Err(ClipError::Probe(_))));
    }

    #[tokio::test]
    async fn test_merge_rejects_empty_inputs() {
        let extractor = FfmpegClipExtractor::new(FfmpegConfig::default());
        let result = extractor
            .merge(&[], Path::new("/tmp/out.mp4"), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ClipError::Merge(_))));
    }

    #[tokio::test]
    async fn test_merge_single_input_copies() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("only.mp4");
        tokio::fs::write(&input, b"fake media").await.unwrap();
        let output = dir.path().join("merged.mp4");

        let extractor = FfmpegClipExtractor::new(FfmpegConfig::default());
        let merged = extractor
            .merge(&[input], &output, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(merged, output);
        assert_eq!(tokio::fs::read(&output).await.unwrap(), b"fake media");
    }

    #[tokio::test]
    async fn test_merge_rejects_mixed_containers() {
        let extractor = FfmpegClipExtractor::new(FfmpegConfig::default());
        let result = extractor
            .merge(
                &[PathBuf::from("/w/a.mp4"), PathBuf::from("/w/b.mkv")],
                Path::new("/w/out.mp4"),
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(ClipError::IncompatibleInputs(_))));
    }
}
