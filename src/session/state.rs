use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Stopped,
    Recording,
    Paused,
}

impl SessionState {
    pub fn label(self) -> &'static str {
        match self {
            SessionState::Stopped => "stopped",
            SessionState::Recording => "recording",
            SessionState::Paused => "paused",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One recorded stretch between start/resume and pause/stop.
///
/// Video and audio live in the same record, so dropping a segment always
/// drops both and the two tracks can never fall out of step.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub index: usize,
    pub video_path: PathBuf,
    /// Separate WAV for this segment; `None` when no audio was captured
    /// separately (no source, or audio muxed into the video file).
    pub audio_path: Option<PathBuf>,
    pub started_at: SystemTime,
    pub created_by_resume: bool,
    /// Delay from capture start to the first significant audio block.
    pub audio_offset: Duration,
    pub audio_significant: bool,
    /// Wall-clock length of the segment.
    pub recorded: Duration,
}

impl Segment {
    pub fn video_path(&self) -> &Path {
        &self.video_path
    }

    pub fn audio_path(&self) -> Option<&Path> {
        self.audio_path.as_deref()
    }
}

/// File names inside the session temp directory.
pub(crate) fn video_segment_name(index: usize) -> String {
    format!("video_segment_{index}.mp4")
}

pub(crate) fn audio_segment_name(index: usize) -> String {
    format!("audio_segment_{index}.wav")
}
