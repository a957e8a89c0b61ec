//! Video post-processing via FFmpeg.
//!
//! Bridges the raw capture downloads on disk and the final assembled
//! output: picks the raw file for a segment and waits for it to stabilize,
//! converts it to MP4, synthesizes silent filler clips for inter-segment
//! gaps, and concatenates everything into one video with a JSON sidecar.
//! All operations degrade to logged `false`/`None` results; only the
//! initial directory setup can fail hard.

use crate::segment::SegmentProcessor;
use ffmpeg_sidecar::command::FfmpegCommand;
use livecap_common::{Segment, SegmentsInfo};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Raw downloads are named `recording-<unix-millis>.webm` by the capture
/// extension.
static RAW_FILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^recording-(\d+)\.webm$").unwrap());

pub const PICK_RETRIES: u32 = 60;
pub const PICK_INTERVAL: Duration = Duration::from_secs(2);
pub const STABLE_CHECKS: u32 = 3;

/// Resolve the FFmpeg binary: the system binary on Linux (declared as a
/// package dependency), the sidecar-adjacent binary elsewhere.
fn resolve_ffmpeg_path() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("ffmpeg")
    }
    #[cfg(not(target_os = "linux"))]
    {
        ffmpeg_sidecar::paths::ffmpeg_path()
    }
}

/// Verify FFmpeg is usable, downloading the sidecar binary if needed.
/// A failure here is a startup warning: recording still proceeds and
/// conversions fail per-segment.
pub fn ensure_ffmpeg() -> Result<(), String> {
    #[cfg(target_os = "linux")]
    {
        match std::process::Command::new(resolve_ffmpeg_path())
            .arg("-version")
            .output()
        {
            Ok(output) if output.status.success() => Ok(()),
            Ok(_) => Err("ffmpeg -version exited with an error".to_string()),
            Err(e) => Err(format!("system ffmpeg not found on PATH: {}", e)),
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        ffmpeg_sidecar::download::auto_download().map_err(|e| e.to_string())
    }
}

/// File and process operations for segment conversion and final assembly.
pub struct VideoProcessor {
    tmp_dir: PathBuf,
    output_dir: PathBuf,
    download_dir: PathBuf,
}

impl VideoProcessor {
    pub fn new(tmp_dir: PathBuf, output_dir: PathBuf, download_dir: PathBuf) -> Self {
        Self {
            tmp_dir,
            output_dir,
            download_dir,
        }
    }

    /// Create the scratch directory for filler clips and manifests.
    pub fn setup_tmp_directory(&self) -> Result<(), String> {
        std::fs::create_dir_all(&self.tmp_dir)
            .map_err(|e| format!("failed to create tmp directory {:?}: {}", self.tmp_dir, e))?;
        info!("Tmp directory ready: {:?}", self.tmp_dir);
        Ok(())
    }

    pub fn cleanup_tmp_directory(&self) {
        if self.tmp_dir.exists() {
            match std::fs::remove_dir_all(&self.tmp_dir) {
                Ok(()) => info!("Tmp directory cleaned up: {:?}", self.tmp_dir),
                Err(e) => warn!("Tmp directory cleanup failed: {}", e),
            }
        }
    }

    /// Find the raw download whose embedded timestamp is closest to the
    /// segment start, then wait until its size has been unchanged for
    /// `stable_checks` consecutive samples. Bounded by `retries` samples
    /// overall; `None` means the caller should skip this segment.
    pub fn pick_and_wait_recording_file(
        &self,
        start_time_unix: i64,
        retries: u32,
        interval: Duration,
        stable_checks: u32,
    ) -> Option<PathBuf> {
        if !self.download_dir.is_dir() {
            error!("Download directory does not exist: {:?}", self.download_dir);
            return None;
        }

        let target_ms = start_time_unix * 1000;
        let mut chosen: Option<PathBuf> = None;
        let mut last_size: Option<u64> = None;
        let mut stable = 0u32;

        for attempt in 0..retries {
            if chosen.is_none() {
                chosen = self.pick_candidate(target_ms);
                if chosen.is_none() {
                    debug!(
                        "Raw recording not found yet, retry {}/{}",
                        attempt + 1,
                        retries
                    );
                    thread::sleep(interval);
                    continue;
                }
            }

            if let Some(path) = &chosen {
                match std::fs::metadata(path) {
                    Ok(meta) => {
                        let size = meta.len();
                        if last_size == Some(size) && size > 0 {
                            stable += 1;
                            if stable >= stable_checks {
                                info!("Raw recording stabilized: {:?}", path);
                                return chosen;
                            }
                        } else {
                            stable = 0;
                        }
                        last_size = Some(size);
                    }
                    Err(e) => {
                        warn!("Raw candidate unreadable, rescanning: {}", e);
                        chosen = None;
                        last_size = None;
                        stable = 0;
                    }
                }
            }
            thread::sleep(interval);
        }

        error!(
            "Raw recording file not found or never stabilized for start_time={}",
            start_time_unix
        );
        None
    }

    fn pick_candidate(&self, target_ms: i64) -> Option<PathBuf> {
        let entries = std::fs::read_dir(&self.download_dir).ok()?;
        let mut candidates: Vec<(PathBuf, i64)> = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(caps) = RAW_FILE.captures(&name) else {
                continue;
            };
            let Ok(stamp) = caps[1].parse::<i64>() else {
                continue;
            };
            let path = entry.path();
            if path.is_file() {
                candidates.push((path, stamp));
            }
        }

        let (path, stamp) = candidates
            .into_iter()
            .min_by_key(|(_, stamp)| (stamp - target_ms).abs())?;
        debug!(
            "Raw recording candidate: {:?} (offset: {}ms)",
            path.file_name().unwrap_or_default(),
            stamp - target_ms
        );
        Some(path)
    }

    /// Transcode a raw WebM download into the standard MP4 container.
    pub fn convert_webm_to_mp4(&self, src: &Path, dst: &Path) -> bool {
        info!(
            "Converting {:?} -> {:?}",
            src.file_name().unwrap_or_default(),
            dst.file_name().unwrap_or_default()
        );
        let args = vec![
            "-y".to_string(),
            "-i".to_string(),
            src.to_string_lossy().into_owned(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            "veryfast".to_string(),
            "-crf".to_string(),
            "18".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            "192k".to_string(),
            dst.to_string_lossy().into_owned(),
        ];
        self.run_ffmpeg(args, "conversion")
    }

    /// Synthesize a silent black clip of the given duration to patch a
    /// timeline gap.
    pub fn create_gap_video(&self, duration_seconds: i64, output_path: &Path) -> bool {
        info!(
            "Generating {}s gap clip: {:?}",
            duration_seconds, output_path
        );
        let args = vec![
            "-y".to_string(),
            "-f".to_string(),
            "lavfi".to_string(),
            "-i".to_string(),
            format!("color=c=black:s=1280x720:d={}", duration_seconds),
            "-f".to_string(),
            "lavfi".to_string(),
            "-i".to_string(),
            "anullsrc=channel_layout=stereo:sample_rate=48000".to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-shortest".to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            output_path.to_string_lossy().into_owned(),
        ];
        self.run_ffmpeg(args, "gap synthesis")
    }

    fn gap_file_path(&self, gap_seconds: i64) -> PathBuf {
        self.tmp_dir.join(format!("gap_{}s.mp4", gap_seconds))
    }

    /// Write the concat manifest, interleaving segment files and gap clips
    /// in chronological order. Segments whose file is missing on disk are
    /// skipped so one failed conversion cannot abort the concatenation.
    pub fn create_concat_list(
        &self,
        segments: &[Segment],
        gaps: &[i64],
        output_path: &Path,
    ) -> Result<(), String> {
        let mut manifest = String::new();
        for (i, segment) in segments.iter().enumerate() {
            let Some(file) = &segment.file else {
                continue;
            };
            let segment_path = self.output_dir.join(file);
            if !segment_path.exists() {
                warn!("Segment file missing, skipping: {:?}", segment_path);
                continue;
            }
            manifest.push_str(&format!("file '{}'\n", concat_path(&segment_path)));

            if i < gaps.len() {
                let gap_path = self.gap_file_path(gaps[i]);
                if gap_path.exists() {
                    manifest.push_str(&format!("file '{}'\n", concat_path(&gap_path)));
                }
            }
        }
        std::fs::write(output_path, manifest)
            .map_err(|e| format!("failed to write {:?}: {}", output_path, e))?;
        info!("Concat manifest written: {:?}", output_path);
        Ok(())
    }

    /// Assemble the final video: synthesize filler clips, write the
    /// manifest, run a lossless stream-copy concat, and persist the
    /// sidecar record. A failed filler clip is skipped rather than
    /// aborting the merge.
    pub fn merge_all_segments(
        &self,
        broadcast_id: &str,
        segments: &[Segment],
        gaps: &[i64],
    ) -> bool {
        info!(
            "Merging {} segments with {} gaps",
            segments.len(),
            gaps.len()
        );
        if segments.is_empty() {
            warn!("No segments to merge");
            return false;
        }

        for &gap_seconds in gaps {
            if gap_seconds <= 0 {
                continue;
            }
            let gap_path = self.gap_file_path(gap_seconds);
            if !gap_path.exists() && !self.create_gap_video(gap_seconds, &gap_path) {
                error!(
                    "Gap clip generation failed for {}s; the merged video will omit it",
                    gap_seconds
                );
            }
        }

        let concat_list = self.tmp_dir.join("concat_list.txt");
        if let Err(e) = self.create_concat_list(segments, gaps, &concat_list) {
            error!("Concat manifest generation failed: {}", e);
            return false;
        }

        let final_output = self.output_dir.join(format!("{}_complete.mp4", broadcast_id));
        let args = vec![
            "-y".to_string(),
            "-f".to_string(),
            "concat".to_string(),
            "-safe".to_string(),
            "0".to_string(),
            "-i".to_string(),
            concat_list.to_string_lossy().into_owned(),
            "-c".to_string(),
            "copy".to_string(),
            final_output.to_string_lossy().into_owned(),
        ];
        if !self.run_ffmpeg(args, "final concat") {
            return false;
        }
        info!("Final video assembled: {:?}", final_output);

        let sidecar = SegmentsInfo {
            broadcast_id: broadcast_id.to_string(),
            total_segments: segments.len(),
            segments: segments.to_vec(),
            gaps: gaps.to_vec(),
            final_video: final_output.to_string_lossy().into_owned(),
            created_at: chrono::Utc::now().timestamp(),
        };
        let sidecar_path = self
            .output_dir
            .join(format!("{}_segments_info.json", broadcast_id));
        match serde_json::to_string_pretty(&sidecar) {
            Ok(json) => match std::fs::write(&sidecar_path, json) {
                Ok(()) => info!("Segments info saved: {:?}", sidecar_path),
                Err(e) => warn!("Failed to write segments info: {}", e),
            },
            Err(e) => warn!("Failed to serialize segments info: {}", e),
        }
        true
    }

    fn run_ffmpeg(&self, args: Vec<String>, what: &str) -> bool {
        let mut command = FfmpegCommand::new_with_path(resolve_ffmpeg_path());
        command.args(args.iter().map(|s| s.as_str()));
        match command.as_inner_mut().output() {
            Ok(output) if output.status.success() => {
                debug!("ffmpeg {} succeeded", what);
                true
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
                let tail: Vec<&str> = tail.into_iter().rev().collect();
                error!(
                    "ffmpeg {} failed with exit code {:?}: {}",
                    what,
                    output.status.code(),
                    tail.join(" | ")
                );
                false
            }
            Err(e) => {
                error!("Failed to run ffmpeg for {}: {}", what, e);
                false
            }
        }
    }
}

/// Forward-slash form for ffmpeg concat manifests (Windows paths included).
fn concat_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

impl SegmentProcessor for VideoProcessor {
    /// Locate the raw download for a completed segment, convert it, and
    /// store it under the segment's deterministic file name.
    fn process_segment(&self, segment: &Segment, broadcast_title: &str) -> bool {
        debug!(
            "Processing segment {} of {:?}",
            segment.segment_id, broadcast_title
        );

        let Some(raw_path) = self.pick_and_wait_recording_file(
            segment.start_time,
            PICK_RETRIES,
            PICK_INTERVAL,
            STABLE_CHECKS,
        ) else {
            error!(
                "Raw recording for segment {} not found",
                segment.segment_id
            );
            return false;
        };

        let output_name = segment
            .file
            .clone()
            .unwrap_or_else(|| Segment::file_name(segment.segment_id));
        let output_path = self.output_dir.join(&output_name);

        if !self.convert_webm_to_mp4(&raw_path, &output_path) {
            error!("Conversion failed for segment {}", segment.segment_id);
            return false;
        }

        info!(
            "Segment {} processed: {}",
            segment.segment_id, output_name
        );
        true
    }
}
