//! Recording session lifecycle: start, pause, resume and stop.
//!
//! Each start/resume opens a segment (audio worker first, then the video
//! producer) inside a per-session temp directory. Pause and stop close the
//! active segment, validate it and drop it when it is too short or empty.
//! Stop hands the surviving segments to the merge engine and then removes the
//! temp directory whatever the merge result.

mod state;
#[cfg(test)]
mod tests;

pub use state::{Segment, SessionState};

use crate::audio::{
    AudioBackend, AudioSourceKind, DeviceSelection, MixerConfig, MixingWriter, SourceRole,
};
use crate::config::defaults;
use crate::error::RecorderError;
use crate::log_debug;
use crate::media::{DurationProbe, MediaTool, MuxedAudioInput, VideoRecording, VideoTrackProducer};
use crate::merge::{non_empty_file, MergeEngine, MergeOutcome};
use state::{audio_segment_name, video_segment_name};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

/// Shortest segment kept when audio is written to its own file.
pub const MIN_SPLIT_SEGMENT: Duration = Duration::from_millis(500);
/// Shortest segment kept when the video producer records audio itself.
pub const MIN_MUXED_SEGMENT: Duration = Duration::from_secs(2);

/// How audio reaches the segment files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SegmentLayout {
    /// Audio worker writes a WAV beside each video segment; merged at stop.
    #[default]
    #[value(name = "split")]
    SplitTracks,
    /// The video producer captures one audio device into the video file.
    Muxed,
}

impl SegmentLayout {
    pub fn min_segment(self) -> Duration {
        match self {
            SegmentLayout::SplitTracks => MIN_SPLIT_SEGMENT,
            SegmentLayout::Muxed => MIN_MUXED_SEGMENT,
        }
    }
}

/// Collaborators a session drives.
#[derive(Clone)]
pub struct SessionDeps {
    pub video: Arc<dyn VideoTrackProducer>,
    pub audio: Arc<dyn AudioBackend>,
    pub probe: Arc<dyn DurationProbe>,
    pub tool: Arc<dyn MediaTool>,
}

/// Validated session settings, snapshotted from the CLI and stored settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Final recording path; required before `start`.
    pub output_path: Option<PathBuf>,
    /// Parent of the session temp directory. Defaults to the output folder.
    pub work_root: Option<PathBuf>,
    pub audio_source: AudioSourceKind,
    pub devices: DeviceSelection,
    pub layout: SegmentLayout,
    /// Overrides the layout's minimum segment length.
    pub min_segment: Option<Duration>,
    pub stop_timeout: Duration,
    pub mixer: MixerConfig,
    pub cleanup_attempts: u32,
    pub cleanup_backoff: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            output_path: None,
            work_root: None,
            audio_source: AudioSourceKind::None,
            devices: DeviceSelection::default(),
            layout: SegmentLayout::SplitTracks,
            min_segment: None,
            stop_timeout: Duration::from_millis(defaults::DEFAULT_STOP_TIMEOUT_MS),
            mixer: MixerConfig::default(),
            cleanup_attempts: defaults::DEFAULT_CLEANUP_RETRIES,
            cleanup_backoff: defaults::DEFAULT_CLEANUP_BACKOFF,
        }
    }
}

impl SessionConfig {
    pub fn min_segment(&self) -> Duration {
        self.min_segment.unwrap_or_else(|| self.layout.min_segment())
    }

    fn separate_audio(&self) -> bool {
        self.layout == SegmentLayout::SplitTracks && self.audio_source != AudioSourceKind::None
    }

    fn muxed_audio(&self) -> Option<MuxedAudioInput> {
        if self.layout != SegmentLayout::Muxed {
            return None;
        }
        let role = *self.audio_source.roles().first()?;
        if self.audio_source == AudioSourceKind::Both {
            log_debug("muxed layout records one device; using the microphone");
        }
        Some(MuxedAudioInput {
            role,
            device: self.devices.for_role(role).map(str::to_string),
        })
    }
}

/// Segment currently being recorded.
struct ActiveSegment {
    index: usize,
    video: Box<dyn VideoRecording>,
    audio: Option<MixingWriter>,
    video_path: PathBuf,
    audio_path: Option<PathBuf>,
    started_at: SystemTime,
    started: Instant,
    created_by_resume: bool,
}

pub struct SegmentSession {
    config: SessionConfig,
    deps: SessionDeps,
    state: SessionState,
    segments: Vec<Segment>,
    next_index: usize,
    temp_dir: Option<PathBuf>,
    active: Option<ActiveSegment>,
    paused_accumulated: Duration,
    current_segment_started: Option<Instant>,
}

impl SegmentSession {
    pub fn new(config: SessionConfig, deps: SessionDeps) -> Self {
        Self {
            config,
            deps,
            state: SessionState::Stopped,
            segments: Vec::new(),
            next_index: 0,
            temp_dir: None,
            active: None,
            paused_accumulated: Duration::ZERO,
            current_segment_started: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Validated segments so far, in recording order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Index the next segment will get; equals the number of kept segments
    /// plus the active one.
    pub fn segment_counter(&self) -> usize {
        self.next_index
    }

    pub fn temp_dir(&self) -> Option<&Path> {
        self.temp_dir.as_deref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Time spent recording, pause gaps excluded.
    pub fn elapsed(&self) -> Duration {
        let running = match (self.state, self.current_segment_started) {
            (SessionState::Recording, Some(started)) => started.elapsed(),
            _ => Duration::ZERO,
        };
        self.paused_accumulated + running
    }

    fn expect_state(
        &self,
        action: &'static str,
        allowed: &[SessionState],
    ) -> Result<(), RecorderError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(RecorderError::InvalidState {
                action,
                state: self.state.label(),
            })
        }
    }

    pub fn start(&mut self) -> Result<(), RecorderError> {
        self.expect_state("start", &[SessionState::Stopped])?;
        let output = self
            .config
            .output_path
            .clone()
            .ok_or(RecorderError::OutputPathMissing)?;
        self.deps.tool.check_available()?;

        self.segments.clear();
        self.next_index = 0;
        self.paused_accumulated = Duration::ZERO;
        self.current_segment_started = None;

        let temp_dir = self.create_temp_dir(&output)?;
        self.temp_dir = Some(temp_dir);

        match self.open_segment(false) {
            Ok(active) => {
                self.current_segment_started = Some(active.started);
                self.active = Some(active);
                self.state = SessionState::Recording;
                tracing::info!(
                    output = %output.display(),
                    source = self.config.audio_source.label(),
                    "recording started"
                );
                Ok(())
            }
            Err(err) => {
                self.release_temp_dir();
                Err(err)
            }
        }
    }

    pub fn pause(&mut self) -> Result<(), RecorderError> {
        self.expect_state("pause", &[SessionState::Recording])?;
        self.close_active();
        self.state = SessionState::Paused;
        tracing::info!(segments = self.segments.len(), "recording paused");
        Ok(())
    }

    /// Open a new segment. On failure the session stays paused.
    pub fn resume(&mut self) -> Result<(), RecorderError> {
        self.expect_state("resume", &[SessionState::Paused])?;
        let active = self.open_segment(true)?;
        self.current_segment_started = Some(active.started);
        self.active = Some(active);
        self.state = SessionState::Recording;
        tracing::info!(index = self.next_index - 1, "recording resumed");
        Ok(())
    }

    /// Close the active segment, merge and release every session resource.
    pub fn stop(&mut self) -> Result<MergeOutcome, RecorderError> {
        self.expect_state("stop", &[SessionState::Recording, SessionState::Paused])?;
        if self.state == SessionState::Recording {
            self.close_active();
        }

        let result = match (self.config.output_path.as_deref(), self.temp_dir.as_deref()) {
            (Some(output), Some(temp_dir)) => {
                MergeEngine::new(
                    Arc::clone(&self.deps.tool),
                    Arc::clone(&self.deps.probe),
                    temp_dir,
                )
                .merge(&self.segments, output)
            }
            (None, _) => Err(RecorderError::OutputPathMissing),
            (_, None) => Err(RecorderError::InvalidState {
                action: "stop",
                state: "missing its temp directory",
            }),
        };
        match &result {
            Ok(outcome) => tracing::info!(
                output = %outcome.output.display(),
                bytes = outcome.bytes,
                elapsed_ms = self.elapsed().as_millis() as u64,
                "recording saved"
            ),
            Err(err) => tracing::error!("merge failed: {err}"),
        }

        self.release_temp_dir();
        self.segments.clear();
        self.next_index = 0;
        self.paused_accumulated = Duration::ZERO;
        self.current_segment_started = None;
        self.state = SessionState::Stopped;
        result
    }

    fn create_temp_dir(&self, output: &Path) -> Result<PathBuf, RecorderError> {
        let root = self
            .config
            .work_root
            .clone()
            .or_else(|| output.parent().map(Path::to_path_buf))
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from("."));
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let dir = root.join(format!("temp_segments_{stamp}"));
        fs::create_dir_all(&dir).map_err(|err| {
            anyhow::anyhow!("failed to create temp directory {}: {err}", dir.display())
        })?;
        log_debug(&format!("session temp directory: {}", dir.display()));
        Ok(dir)
    }

    fn open_segment(&mut self, created_by_resume: bool) -> Result<ActiveSegment, RecorderError> {
        let temp_dir = self.temp_dir.clone().ok_or(RecorderError::InvalidState {
            action: "open a segment",
            state: "missing its temp directory",
        })?;
        let index = self.next_index;
        let video_path = temp_dir.join(video_segment_name(index));
        let audio_path = self
            .config
            .separate_audio()
            .then(|| temp_dir.join(audio_segment_name(index)));

        // Producers record from the moment they spawn, before `begin` or
        // `start` return.
        let started_at = SystemTime::now();
        let started = Instant::now();

        let audio = match &audio_path {
            Some(path) => Some(MixingWriter::start(
                Arc::clone(&self.deps.audio),
                self.config.audio_source,
                &self.config.devices,
                path,
                self.config.mixer.clone(),
            )?),
            None => None,
        };

        let muxed = self.config.muxed_audio();
        let video = match self.deps.video.begin(&video_path, muxed.as_ref()) {
            Ok(video) => video,
            Err(err) => {
                if let Some(writer) = audio {
                    let _ = writer.stop(None);
                }
                if let Some(path) = &audio_path {
                    remove_quietly(path);
                }
                remove_quietly(&video_path);
                return Err(err.context(format!("failed to start video segment {index}")).into());
            }
        };

        self.next_index += 1;
        log_debug(&format!(
            "segment {index} opened (resume={created_by_resume}, audio={})",
            audio_path.is_some()
        ));
        Ok(ActiveSegment {
            index,
            video,
            audio,
            video_path,
            audio_path,
            started_at,
            started,
            created_by_resume,
        })
    }

    /// Finish the active segment, keep it if valid and bank its time.
    fn close_active(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        let recorded = active.started.elapsed();
        self.paused_accumulated += recorded;
        self.current_segment_started = None;

        match self.finish_segment(active, recorded) {
            Ok(segment) => {
                tracing::info!(
                    index = segment.index,
                    recorded_ms = segment.recorded.as_millis() as u64,
                    offset_ms = segment.audio_offset.as_millis() as u64,
                    "segment kept"
                );
                self.segments.push(segment);
            }
            Err(err) => {
                tracing::warn!("{err}");
                log_debug(&format!("{err}"));
                self.next_index = self.next_index.saturating_sub(1);
            }
        }
    }

    /// Stop the producer, then drain the audio worker padded to the video
    /// length. Returns the segment or why it was discarded.
    fn finish_segment(
        &self,
        active: ActiveSegment,
        recorded: Duration,
    ) -> Result<Segment, RecorderError> {
        let ActiveSegment {
            index,
            video,
            audio,
            video_path,
            audio_path,
            started_at,
            created_by_resume,
            ..
        } = active;

        match video.finish(self.config.stop_timeout) {
            Ok(outcome) if outcome.forced => {
                log_debug(&format!("segment {index}: video producer was force-stopped"))
            }
            Ok(_) => {}
            Err(err) => log_debug(&format!("segment {index}: video finish failed: {err:#}")),
        }

        let video_ok = non_empty_file(&video_path);
        let mut audio_offset = Duration::ZERO;
        let mut audio_significant = false;
        if let Some(writer) = audio {
            let video_secs = if video_ok {
                self.deps
                    .probe
                    .duration_secs(&video_path)
                    .unwrap_or_else(|err| {
                        log_debug(&format!("segment {index}: probe failed ({err:#}); using wall clock"));
                        recorded.as_secs_f64()
                    })
            } else {
                recorded.as_secs_f64()
            };
            match writer.stop(Some(video_secs)) {
                Ok(report) => {
                    audio_offset = report.offset;
                    audio_significant = report.significant;
                }
                Err(err) => log_debug(&format!("segment {index}: audio close failed: {err}")),
            }
        }

        let min = self.config.min_segment();
        let reason = if !video_ok {
            Some("video file missing or empty".to_string())
        } else if recorded < min {
            Some(format!(
                "recorded {:.2}s, shorter than {:.2}s",
                recorded.as_secs_f64(),
                min.as_secs_f64()
            ))
        } else {
            None
        };
        if let Some(reason) = reason {
            remove_quietly(&video_path);
            if let Some(path) = &audio_path {
                remove_quietly(path);
            }
            return Err(RecorderError::SegmentTooShortOrEmpty { index, reason });
        }

        Ok(Segment {
            index,
            video_path,
            audio_path,
            started_at,
            created_by_resume,
            audio_offset,
            audio_significant,
            recorded,
        })
    }

    fn release_temp_dir(&mut self) {
        if let Some(dir) = self.temp_dir.take() {
            if let Err(err) = remove_dir_with_retries(
                &dir,
                self.config.cleanup_attempts,
                self.config.cleanup_backoff,
            ) {
                tracing::warn!("{err}");
                log_debug(&format!("{err}"));
            }
        }
    }
}

impl Drop for SegmentSession {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            if let Err(err) = active.video.finish(self.config.stop_timeout) {
                log_debug(&format!("video finish on drop failed: {err:#}"));
            }
            if let Some(writer) = active.audio {
                let _ = writer.stop(None);
            }
        }
    }
}

fn remove_quietly(path: &Path) {
    if path.exists() {
        if let Err(err) = fs::remove_file(path) {
            log_debug(&format!("failed to remove {}: {err}", path.display()));
        }
    }
}

/// Delete a directory tree, retrying while something (an encoder that has not
/// fully exited, an indexer) still holds a file open.
pub fn remove_dir_with_retries(
    dir: &Path,
    attempts: u32,
    backoff: Duration,
) -> Result<(), RecorderError> {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match fs::remove_dir_all(dir) {
            Ok(()) => {
                log_debug(&format!("removed temp directory {}", dir.display()));
                return Ok(());
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                log_debug(&format!(
                    "attempt {attempt} to remove {} failed: {err}",
                    dir.display()
                ));
                if attempt < attempts {
                    thread::sleep(backoff);
                }
            }
        }
    }
    Err(RecorderError::TempCleanupFailure {
        path: dir.to_path_buf(),
        attempts,
    })
}

/// `hh:mm:ss` for the elapsed display.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// Roles the session opens for its source, for status output.
pub fn describe_sources(kind: AudioSourceKind) -> String {
    let roles: Vec<&str> = kind.roles().iter().map(|r: &SourceRole| r.label()).collect();
    if roles.is_empty() {
        "no audio".to_string()
    } else {
        roles.join(" + ")
    }
}
