//! Segmented desktop recorder: pausable screen capture with gated, mixed
//! microphone and system audio, stitched into one file on stop.

pub mod app;
pub mod audio;
pub mod config;
pub mod error;
mod lock;
pub mod media;
pub mod merge;
pub mod session;
mod telemetry;
#[cfg(test)]
pub(crate) mod test_support;

pub use app::{crash_log_path, init_logging, log_debug, log_file_path, log_panic};
pub use error::{MergeStage, RecorderError};
pub use session::{SegmentSession, SessionConfig, SessionDeps, SessionState};
pub use telemetry::{init_tracing, tracing_log_path};
