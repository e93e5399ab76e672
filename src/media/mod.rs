//! Out-of-process media collaborators: screen capture, duration probing and
//! the encoding tool used for concat and mux.
//!
//! Each sits behind a trait so session and merge logic can run against fakes.

mod probe;
mod process;
mod tool;
mod video;

pub use probe::{DurationProbe, FfprobeDurationProbe};
pub use tool::{FfmpegTool, MediaTool};
pub use video::{
    FfmpegScreenRecorder, FinishOutcome, MuxedAudioInput, ScreenCaptureOptions, VideoRecording,
    VideoTrackProducer,
};
