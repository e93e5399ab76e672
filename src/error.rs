//! Typed failures surfaced at the session, capture and merge seams.
//!
//! Internals use `anyhow` with context strings; these variants are what a
//! front-end matches on to decide between "tell the user" and "keep going".

use crate::audio::SourceRole;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("{role} device '{name}' not found")]
    DeviceNotFound { role: SourceRole, name: String },

    #[error("{role} device '{name}' is not active: {detail}")]
    DeviceInactive {
        role: SourceRole,
        name: String,
        detail: String,
    },

    #[error("encoding tool unavailable: {0}")]
    ToolUnavailable(String),

    #[error("no output path selected; choose an output folder before recording")]
    OutputPathMissing,

    #[error("cannot {action} while the session is {state}")]
    InvalidState {
        action: &'static str,
        state: &'static str,
    },

    #[error("segment {index} discarded: {reason}")]
    SegmentTooShortOrEmpty { index: usize, reason: String },

    #[error("merge failed while {stage}: {detail}")]
    MergeStageFailure { stage: MergeStage, detail: String },

    #[error("could not remove temp directory '{}' after {attempts} attempts", path.display())]
    TempCleanupFailure { path: PathBuf, attempts: u32 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RecorderError {
    pub(crate) fn merge(stage: MergeStage, err: impl fmt::Display) -> Self {
        RecorderError::MergeStageFailure {
            stage,
            detail: err.to_string(),
        }
    }

    /// Device problems only abort the affected segment; the session survives.
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            RecorderError::DeviceNotFound { .. } | RecorderError::DeviceInactive { .. }
        )
    }
}

/// Merge pipeline stages, used to label failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStage {
    Validating,
    ConcatenatingVideo,
    ProbingVideo,
    ConcatenatingAudio,
    Muxing,
    Promoting,
}

impl MergeStage {
    pub fn label(self) -> &'static str {
        match self {
            MergeStage::Validating => "validating segments",
            MergeStage::ConcatenatingVideo => "concatenating video",
            MergeStage::ProbingVideo => "probing merged video",
            MergeStage::ConcatenatingAudio => "concatenating audio",
            MergeStage::Muxing => "combining video and audio",
            MergeStage::Promoting => "moving output into place",
        }
    }
}

impl fmt::Display for MergeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
