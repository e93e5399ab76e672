//! Command-line parsing, validation and persisted settings.

pub mod defaults;
mod settings;
mod validation;

use crate::audio::AudioSourceKind;
use crate::session::SegmentLayout;
use clap::Parser;
use std::path::PathBuf;

use defaults::{
    DEFAULT_CLEANUP_RETRIES, DEFAULT_FFMPEG_CMD, DEFAULT_FFPROBE_CMD, DEFAULT_FRAMERATE,
    DEFAULT_GATE_THRESHOLD, DEFAULT_STOP_TIMEOUT_MS, DEFAULT_TOOL_TIMEOUT_MS,
};
pub use settings::{default_settings_path, RecorderSettings};
pub use validation::{ensure_writable_dir, recording_file_name};

/// CLI options for the deskrec recorder. Validated values keep the ffmpeg
/// command lines safe.
#[derive(Debug, Parser, Clone)]
#[command(about = "Segmented desktop recorder", author, version)]
pub struct AppConfig {
    /// Folder the recording is saved into (defaults to the stored base path)
    #[arg(long = "output-dir", env = "DESKREC_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    /// Exact output file; overrides --output-dir and the timestamped name
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,

    /// Audio captured next to the video
    #[arg(long = "audio-source", value_enum)]
    pub audio_source: Option<AudioSourceKind>,

    /// Microphone endpoint name (system default if unset)
    #[arg(long = "mic-device")]
    pub mic_device: Option<String>,

    /// Render endpoint captured as system audio (system default if unset)
    #[arg(long = "system-device")]
    pub system_device: Option<String>,

    /// FFmpeg binary location
    #[arg(long = "ffmpeg-cmd", env = "DESKREC_FFMPEG", default_value = DEFAULT_FFMPEG_CMD)]
    pub ffmpeg_cmd: String,

    /// FFprobe binary location
    #[arg(long = "ffprobe-cmd", env = "DESKREC_FFPROBE", default_value = DEFAULT_FFPROBE_CMD)]
    pub ffprobe_cmd: String,

    /// Screen capture frame rate
    #[arg(long, default_value_t = DEFAULT_FRAMERATE)]
    pub framerate: u32,

    /// Grabber input (`desktop`, an X11 display, an avfoundation index)
    #[arg(long = "video-input")]
    pub video_input: Option<String>,

    /// Where segment audio is written
    #[arg(long, value_enum, default_value_t = SegmentLayout::SplitTracks)]
    pub layout: SegmentLayout,

    /// Print render and capture endpoints and exit
    #[arg(long = "list-devices", default_value_t = false)]
    pub list_devices: bool,

    /// Enable file logging (debug)
    #[arg(long = "logs", env = "DESKREC_LOGS", default_value_t = false)]
    pub logs: bool,

    /// Disable all file logging (overrides --logs and log env vars)
    #[arg(long = "no-logs", env = "DESKREC_NO_LOGS", default_value_t = false)]
    pub no_logs: bool,

    /// Enable verbose timing logs
    #[arg(long)]
    pub log_timings: bool,

    /// Settings file (defaults to <config dir>/deskrec/settings.json)
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Do not write the effective choices back to the settings file
    #[arg(long = "no-save-settings", default_value_t = false)]
    pub no_save_settings: bool,

    /// How long a producer may take to finish after a stop request (milliseconds)
    #[arg(long = "stop-timeout-ms", default_value_t = DEFAULT_STOP_TIMEOUT_MS)]
    pub stop_timeout_ms: u64,

    /// Deadline for each concat/mux run (milliseconds)
    #[arg(long = "tool-timeout-ms", default_value_t = DEFAULT_TOOL_TIMEOUT_MS)]
    pub tool_timeout_ms: u64,

    /// Peak amplitude that opens a segment's audio gate (0..1)
    #[arg(long = "gate-threshold", default_value_t = DEFAULT_GATE_THRESHOLD)]
    pub gate_threshold: f32,

    /// Attempts at removing the temp directory after a session
    #[arg(long = "cleanup-retries", default_value_t = DEFAULT_CLEANUP_RETRIES)]
    pub cleanup_retries: u32,
}
