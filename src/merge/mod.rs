//! Stitches validated segments into the final recording.
//!
//! Video is joined losslessly through the concat demuxer. Audio segments are
//! decoded, normalized to the capture format and written back to back into a
//! single WAV, padded to the video length, then muxed with the first
//! segment's gate offset as the audio start delay. Every intermediate lives
//! in the session work directory; only a validated final file is moved to
//! the destination.

mod audio;
mod manifest;
#[cfg(test)]
mod tests;

use crate::error::{MergeStage, RecorderError};
use crate::log_debug;
use crate::media::{DurationProbe, MediaTool};
use crate::session::Segment;
use anyhow::{anyhow, Context, Result};
use audio::AudioAssembler;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const CONCAT_MANIFEST: &str = "concat.txt";
pub const MERGED_VIDEO: &str = "merged_video.mp4";
pub const MERGED_AUDIO: &str = "merged_audio.wav";

/// What a successful merge produced.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub output: PathBuf,
    pub segments_merged: usize,
    pub segments_dropped: usize,
    pub with_audio: bool,
    pub audio_offset_secs: f64,
    pub bytes: u64,
}

pub struct MergeEngine {
    tool: Arc<dyn MediaTool>,
    probe: Arc<dyn DurationProbe>,
    work_dir: PathBuf,
}

impl MergeEngine {
    pub fn new(tool: Arc<dyn MediaTool>, probe: Arc<dyn DurationProbe>, work_dir: &Path) -> Self {
        Self {
            tool,
            probe,
            work_dir: work_dir.to_path_buf(),
        }
    }

    pub fn merge(
        &self,
        segments: &[Segment],
        destination: &Path,
    ) -> Result<MergeOutcome, RecorderError> {
        let kept = self.valid_segments(segments);
        let dropped = segments.len() - kept.len();
        if kept.is_empty() {
            return Err(RecorderError::merge(
                MergeStage::Validating,
                "no valid video segments to merge",
            ));
        }
        tracing::info!(kept = kept.len(), dropped, "merging segments");

        let merged_video = self.work_dir.join(MERGED_VIDEO);
        self.concat_video(&kept, &merged_video)
            .map_err(|err| RecorderError::merge(MergeStage::ConcatenatingVideo, format!("{err:#}")))?;

        let with_audio = kept.iter().any(|segment| segment.audio_path.is_some());
        let (staged, audio_offset_secs) = if with_audio {
            self.add_audio(&kept, &merged_video, destination)?
        } else {
            (merged_video, 0.0)
        };

        let bytes = promote(&staged, destination)
            .map_err(|err| RecorderError::merge(MergeStage::Promoting, format!("{err:#}")))?;
        tracing::info!(output = %destination.display(), bytes, with_audio, "merge complete");
        Ok(MergeOutcome {
            output: destination.to_path_buf(),
            segments_merged: kept.len(),
            segments_dropped: dropped,
            with_audio,
            audio_offset_secs,
            bytes,
        })
    }

    /// Segments whose video file exists and is non-empty, in order. An
    /// invalid video takes its paired audio with it.
    fn valid_segments<'a>(&self, segments: &'a [Segment]) -> Vec<&'a Segment> {
        segments
            .iter()
            .filter(|segment| {
                let valid = non_empty_file(segment.video_path());
                if !valid {
                    log_debug(&format!(
                        "dropping segment {}: video {} missing or empty",
                        segment.index,
                        segment.video_path.display()
                    ));
                }
                valid
            })
            .collect()
    }

    fn concat_video(&self, kept: &[&Segment], merged_video: &Path) -> Result<()> {
        let manifest_path = self.work_dir.join(CONCAT_MANIFEST);
        manifest::write_manifest(&manifest_path, kept.iter().map(|s| s.video_path()))?;
        self.tool.concat_video(&manifest_path, merged_video)?;
        require_non_empty(merged_video)
    }

    /// Build the merged WAV and mux it under the merged video. Returns the
    /// staged output and the applied offset.
    fn add_audio(
        &self,
        kept: &[&Segment],
        merged_video: &Path,
        destination: &Path,
    ) -> Result<(PathBuf, f64), RecorderError> {
        let video_secs = self
            .probe
            .duration_secs(merged_video)
            .map_err(|err| RecorderError::merge(MergeStage::ProbingVideo, format!("{err:#}")))?;
        let offset = kept
            .iter()
            .find(|segment| segment.audio_path.is_some())
            .map(|segment| segment.audio_offset.as_secs_f64())
            .unwrap_or(0.0);

        let merged_audio = self.work_dir.join(MERGED_AUDIO);
        self.assemble_audio(kept, &merged_audio, video_secs, offset)
            .map_err(|err| {
                RecorderError::merge(MergeStage::ConcatenatingAudio, format!("{err:#}"))
            })?;

        let staged = self.work_dir.join(staged_name(destination));
        self.tool
            .mux(merged_video, &merged_audio, offset, &staged)
            .and_then(|_| require_non_empty(&staged))
            .map_err(|err| RecorderError::merge(MergeStage::Muxing, format!("{err:#}")))?;
        Ok((staged, offset))
    }

    fn assemble_audio(
        &self,
        kept: &[&Segment],
        merged_audio: &Path,
        video_secs: f64,
        offset: f64,
    ) -> Result<()> {
        let mut assembler = AudioAssembler::create(merged_audio)?;
        for segment in kept {
            let appended = match segment.audio_path() {
                Some(path) if non_empty_file(path) => assembler.append_file(path).map_err(|err| {
                    log_debug(&format!("segment {} audio unreadable: {err:#}", segment.index));
                    err
                }),
                _ => Err(anyhow!("segment {} has no audio file", segment.index)),
            };
            if appended.is_err() {
                // Hold the slot so later segments stay under their video.
                let secs = self
                    .probe
                    .duration_secs(segment.video_path())
                    .unwrap_or_else(|_| segment.recorded.as_secs_f64());
                assembler.append_silence(secs)?;
                log_debug(&format!(
                    "filled segment {} with {secs:.2}s of silence",
                    segment.index
                ));
            }
        }

        let audio_secs = assembler.duration_secs();
        if audio_secs + offset < video_secs {
            let pad = video_secs - audio_secs - offset;
            assembler.append_silence(pad)?;
            log_debug(&format!(
                "padded merged audio with {pad:.2}s of silence to match video {video_secs:.2}s"
            ));
        }
        assembler.finalize()?;
        require_non_empty(merged_audio)
    }
}

fn staged_name(destination: &Path) -> String {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output.mp4".to_string());
    format!("staged_{name}")
}

pub(crate) fn non_empty_file(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

fn require_non_empty(path: &Path) -> Result<()> {
    if non_empty_file(path) {
        Ok(())
    } else {
        Err(anyhow!("{} is missing or empty", path.display()))
    }
}

/// Move the staged file into place, copying when a rename cannot cross
/// filesystems. Returns the final size.
fn promote(staged: &Path, destination: &Path) -> Result<u64> {
    require_non_empty(staged)?;
    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    if let Err(err) = fs::rename(staged, destination) {
        log_debug(&format!("rename into place failed ({err}); copying instead"));
        copy_into_place(staged, destination)?;
    }
    let bytes = fs::metadata(destination)
        .with_context(|| format!("failed to stat {}", destination.display()))?
        .len();
    if bytes == 0 {
        let _ = fs::remove_file(destination);
        return Err(anyhow!("{} is empty after promotion", destination.display()));
    }
    Ok(bytes)
}

/// Copy next to the destination first so a failed copy never leaves a
/// truncated file under the final name.
fn copy_into_place(staged: &Path, destination: &Path) -> Result<()> {
    let partial = partial_path(destination);
    let copied = fs::copy(staged, &partial).and_then(|_| fs::rename(&partial, destination));
    if let Err(err) = copied {
        let _ = fs::remove_file(&partial);
        return Err(err).with_context(|| {
            format!(
                "failed to copy {} to {}",
                staged.display(),
                destination.display()
            )
        });
    }
    let _ = fs::remove_file(staged);
    Ok(())
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "output.mp4".into());
    name.push(".part");
    destination.with_file_name(name)
}
