use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::debug;

use crate::error::PipelineError;
use crate::models::{SampledFrame, SegmentDescriptor};

/// Turns a video segment into timestamped stills on disk.
pub trait FrameSource: Send + Sync {
    fn sample(
        &self,
        segment: &SegmentDescriptor,
        fps: f64,
        out_dir: &Path,
    ) -> Result<Vec<SampledFrame>, PipelineError>;
}

/// Samples segments by running an `ffmpeg` binary with the `fps` filter.
pub struct FfmpegFrameSource {
    binary: PathBuf,
}

impl FfmpegFrameSource {
    pub fn new() -> Self {
        Self::with_binary("ffmpeg")
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for FfmpegFrameSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for FfmpegFrameSource {
    fn sample(
        &self,
        segment: &SegmentDescriptor,
        fps: f64,
        out_dir: &Path,
    ) -> Result<Vec<SampledFrame>, PipelineError> {
        if !segment.file_path.is_file() {
            return Err(PipelineError::decode(&segment.file_path, "segment file missing"));
        }
        fs::create_dir_all(out_dir).map_err(|err| PipelineError::decode(out_dir, err))?;

        let output = Command::new(&self.binary)
            .args(["-hide_banner", "-loglevel", "error", "-nostdin", "-y", "-i"])
            .arg(&segment.file_path)
            .args(["-vf", &format!("fps={fps}"), "-f", "image2"])
            .arg(out_dir.join("%06d.png"))
            .output()
            .map_err(|err| PipelineError::decode(&segment.file_path, format!("ffmpeg spawn failed: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::decode(
                &segment.file_path,
                format!("ffmpeg exited with {}: {}", output.status, stderr.trim()),
            ));
        }

        let frames = collect_stills(out_dir, segment, fps)?;
        debug!(
            "Sampled {} still(s) from segment {} at {fps} fps",
            frames.len(),
            segment.segment_id
        );
        Ok(frames)
    }
}

/// Lists the PNG stills in `dir` in name order and assigns timestamps at
/// `fps` from the segment start. Stills past the segment end are dropped.
pub fn collect_stills(
    dir: &Path,
    segment: &SegmentDescriptor,
    fps: f64,
) -> Result<Vec<SampledFrame>, PipelineError> {
    let entries = fs::read_dir(dir).map_err(|err| PipelineError::decode(dir, err))?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().map(|ext| ext == "png").unwrap_or(false))
        .collect();
    paths.sort();

    let step_ns = 1_000_000_000.0 / fps;
    let mut frames = Vec::with_capacity(paths.len());
    for (index, path) in paths.into_iter().enumerate() {
        let ts_ns = segment.t_start + (index as f64 * step_ns).round() as i64;
        if segment.t_end > segment.t_start && ts_ns >= segment.t_end {
            let _ = fs::remove_file(&path);
            continue;
        }
        frames.push(SampledFrame {
            index: index as u32,
            ts_ns,
            path,
        });
    }
    Ok(frames)
}
