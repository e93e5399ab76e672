use super::process::run_with_deadline;
use crate::error::RecorderError;
use anyhow::{Context, Result};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

/// The encoding tool used outside of live capture.
pub trait MediaTool: Send + Sync {
    /// Fail with `ToolUnavailable` when the tool cannot run at all.
    fn check_available(&self) -> Result<(), RecorderError>;

    /// Losslessly join the files listed in a concat manifest.
    fn concat_video(&self, manifest: &Path, output: &Path) -> Result<()>;

    /// Copy the video stream, encode the audio to AAC 192k and delay the audio
    /// start by `audio_offset_secs`.
    fn mux(&self, video: &Path, audio: &Path, audio_offset_secs: f64, output: &Path) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct FfmpegTool {
    ffmpeg: String,
    timeout: Duration,
}

impl FfmpegTool {
    pub fn new(ffmpeg: impl Into<String>, timeout: Duration) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            timeout,
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.ffmpeg);
        command.arg("-hide_banner").arg("-y");
        command
    }
}

pub(crate) fn concat_args(manifest: &Path, output: &Path) -> Vec<String> {
    vec![
        "-f".into(),
        "concat".into(),
        "-safe".into(),
        "0".into(),
        "-i".into(),
        manifest.to_string_lossy().into_owned(),
        "-c".into(),
        "copy".into(),
        "-fflags".into(),
        "+genpts".into(),
        output.to_string_lossy().into_owned(),
    ]
}

pub(crate) fn mux_args(video: &Path, audio: &Path, offset_secs: f64, output: &Path) -> Vec<String> {
    vec![
        "-i".into(),
        video.to_string_lossy().into_owned(),
        "-itsoffset".into(),
        format!("{offset_secs:.2}"),
        "-i".into(),
        audio.to_string_lossy().into_owned(),
        "-c:v".into(),
        "copy".into(),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        "192k".into(),
        "-map".into(),
        "0:v".into(),
        "-map".into(),
        "1:a".into(),
        "-fflags".into(),
        "+genpts".into(),
        output.to_string_lossy().into_owned(),
    ]
}

impl MediaTool for FfmpegTool {
    fn check_available(&self) -> Result<(), RecorderError> {
        let status = Command::new(&self.ffmpeg)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|err| RecorderError::ToolUnavailable(format!("{}: {err}", self.ffmpeg)))?;
        if !status.success() {
            return Err(RecorderError::ToolUnavailable(format!(
                "{} -version exited with {status}",
                self.ffmpeg
            )));
        }
        Ok(())
    }

    fn concat_video(&self, manifest: &Path, output: &Path) -> Result<()> {
        let mut command = self.command();
        command.args(concat_args(manifest, output));
        run_with_deadline(command, "ffmpeg-concat", self.timeout)
            .with_context(|| format!("video concat into {}", output.display()))
    }

    fn mux(&self, video: &Path, audio: &Path, audio_offset_secs: f64, output: &Path) -> Result<()> {
        let mut command = self.command();
        command.args(mux_args(video, audio, audio_offset_secs, output));
        run_with_deadline(command, "ffmpeg-mux", self.timeout)
            .with_context(|| format!("mux into {}", output.display()))
    }
}
