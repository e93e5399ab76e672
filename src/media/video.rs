use super::process::{force_kill, summarize_tail, wait_with_timeout, StderrTail};
use crate::audio::SourceRole;
use crate::log_debug;
use anyhow::{anyhow, Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Audio device the screen recorder should capture into the same file when
/// segments are recorded with audio muxed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxedAudioInput {
    pub role: SourceRole,
    pub device: Option<String>,
}

/// How a recording ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinishOutcome {
    /// The producer ignored the graceful stop and was killed.
    pub forced: bool,
    pub exit_ok: bool,
}

pub trait VideoTrackProducer: Send + Sync {
    /// Start writing one video segment to `path`.
    fn begin(
        &self,
        path: &Path,
        muxed_audio: Option<&MuxedAudioInput>,
    ) -> Result<Box<dyn VideoRecording>>;
}

pub trait VideoRecording: Send {
    fn path(&self) -> &Path;

    /// Ask the producer to finish, wait up to `timeout`, then force it.
    fn finish(self: Box<Self>, timeout: Duration) -> Result<FinishOutcome>;
}

#[derive(Debug, Clone)]
pub struct ScreenCaptureOptions {
    pub ffmpeg: String,
    pub framerate: u32,
    /// Grabber input, e.g. `desktop`, `:0.0` or `1:none`. Platform default if unset.
    pub input: Option<String>,
    /// How long to watch a fresh child for an immediate failure.
    pub startup_grace: Duration,
}

impl Default for ScreenCaptureOptions {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            framerate: 30,
            input: None,
            startup_grace: Duration::from_millis(300),
        }
    }
}

/// Screen capture through an `ffmpeg` child per segment, encoding
/// libx264/ultrafast/yuv420p. Stopped by writing `q` to its stdin.
#[derive(Debug, Clone, Default)]
pub struct FfmpegScreenRecorder {
    options: ScreenCaptureOptions,
}

impl FfmpegScreenRecorder {
    pub fn new(options: ScreenCaptureOptions) -> Self {
        Self { options }
    }

    pub(crate) fn build_args(&self, path: &Path, muxed_audio: Option<&MuxedAudioInput>) -> Vec<String> {
        let mut args: Vec<String> = vec!["-y".into()];
        args.extend(grabber_args(
            self.options.framerate,
            self.options.input.as_deref(),
        ));
        if let Some(audio) = muxed_audio {
            args.extend(audio_input_args(audio));
        }
        args.extend(
            [
                "-c:v",
                "libx264",
                "-preset",
                "ultrafast",
                "-pix_fmt",
                "yuv420p",
            ]
            .map(String::from),
        );
        if muxed_audio.is_some() {
            args.extend(["-c:a", "aac", "-b:a", "192k"].map(String::from));
        }
        args.extend(["-metadata:s:v", "creation_time=now"].map(String::from));
        args.push(path.to_string_lossy().into_owned());
        args
    }
}

#[cfg(target_os = "windows")]
fn grabber_args(framerate: u32, input: Option<&str>) -> Vec<String> {
    vec![
        "-f".into(),
        "gdigrab".into(),
        "-framerate".into(),
        framerate.to_string(),
        "-rtbufsize".into(),
        "200M".into(),
        "-use_wallclock_as_timestamps".into(),
        "1".into(),
        "-fflags".into(),
        "+genpts".into(),
        "-i".into(),
        input.unwrap_or("desktop").to_string(),
    ]
}

#[cfg(target_os = "macos")]
fn grabber_args(framerate: u32, input: Option<&str>) -> Vec<String> {
    vec![
        "-f".into(),
        "avfoundation".into(),
        "-framerate".into(),
        framerate.to_string(),
        "-capture_cursor".into(),
        "1".into(),
        "-i".into(),
        input.unwrap_or("1:none").to_string(),
    ]
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn grabber_args(framerate: u32, input: Option<&str>) -> Vec<String> {
    let display = input
        .map(str::to_string)
        .or_else(|| std::env::var("DISPLAY").ok())
        .unwrap_or_else(|| ":0.0".to_string());
    vec![
        "-f".into(),
        "x11grab".into(),
        "-framerate".into(),
        framerate.to_string(),
        "-use_wallclock_as_timestamps".into(),
        "1".into(),
        "-fflags".into(),
        "+genpts".into(),
        "-i".into(),
        display,
    ]
}

#[cfg(target_os = "windows")]
fn audio_input_args(audio: &MuxedAudioInput) -> Vec<String> {
    let device = audio.device.as_deref().unwrap_or("default");
    vec![
        "-f".into(),
        "dshow".into(),
        "-i".into(),
        format!("audio={device}"),
    ]
}

#[cfg(target_os = "macos")]
fn audio_input_args(audio: &MuxedAudioInput) -> Vec<String> {
    let device = audio.device.as_deref().unwrap_or("0");
    vec!["-f".into(), "avfoundation".into(), "-i".into(), format!(":{device}")]
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn audio_input_args(audio: &MuxedAudioInput) -> Vec<String> {
    let device = match (audio.role, audio.device.as_deref()) {
        (_, Some(name)) => name.to_string(),
        (SourceRole::SystemLoopback, None) => "@DEFAULT_MONITOR@".to_string(),
        (SourceRole::Microphone, None) => "default".to_string(),
    };
    vec!["-f".into(), "pulse".into(), "-i".into(), device]
}

impl VideoTrackProducer for FfmpegScreenRecorder {
    fn begin(
        &self,
        path: &Path,
        muxed_audio: Option<&MuxedAudioInput>,
    ) -> Result<Box<dyn VideoRecording>> {
        let args = self.build_args(path, muxed_audio);
        log_debug(&format!("ffmpeg video args: {}", args.join(" ")));
        let mut child = Command::new(&self.options.ffmpeg)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start {}", self.options.ffmpeg))?;
        let stdin = child.stdin.take();
        let tail = StderrTail::spawn(&mut child, "ffmpeg-video");

        thread::sleep(self.options.startup_grace);
        if let Some(status) = child
            .try_wait()
            .context("failed to poll screen recorder")?
        {
            let lines = tail.finish();
            return Err(anyhow!(
                "screen recorder exited at startup with {status}: {}",
                summarize_tail(&lines)
            ));
        }

        tracing::info!(path = %path.display(), muxed_audio = muxed_audio.is_some(), "video segment started");
        Ok(Box::new(FfmpegRecording {
            child,
            stdin,
            tail,
            path: path.to_path_buf(),
            started: Instant::now(),
        }))
    }
}

struct FfmpegRecording {
    child: Child,
    stdin: Option<ChildStdin>,
    tail: StderrTail,
    path: PathBuf,
    started: Instant,
}

impl VideoRecording for FfmpegRecording {
    fn path(&self) -> &Path {
        &self.path
    }

    fn finish(mut self: Box<Self>, timeout: Duration) -> Result<FinishOutcome> {
        if let Some(mut stdin) = self.stdin.take() {
            if let Err(err) = stdin.write_all(b"q\n").and_then(|_| stdin.flush()) {
                log_debug(&format!("failed to send graceful stop to ffmpeg: {err}"));
            }
        }

        let status = wait_with_timeout(&mut self.child, timeout)?;
        let forced = status.is_none();
        if forced {
            tracing::warn!(path = %self.path.display(), "screen recorder ignored stop; killing");
            force_kill(&mut self.child, "ffmpeg-video");
        }
        let this = *self;
        let lines = this.tail.finish();
        let exit_ok = status.map(|s| s.success()).unwrap_or(false);
        if !exit_ok && !lines.is_empty() {
            log_debug(&format!("ffmpeg video stderr: {}", summarize_tail(&lines)));
        }
        tracing::info!(
            path = %this.path.display(),
            recorded_ms = this.started.elapsed().as_millis() as u64,
            forced,
            exit_ok,
            "video segment finished"
        );
        Ok(FinishOutcome { forced, exit_ok })
    }
}
