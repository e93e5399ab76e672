use std::time::Duration;

pub use crate::audio::DEFAULT_GATE_THRESHOLD;

pub const DEFAULT_FFMPEG_CMD: &str = "ffmpeg";
pub const DEFAULT_FFPROBE_CMD: &str = "ffprobe";
pub const DEFAULT_FRAMERATE: u32 = 30;
pub const DEFAULT_STOP_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_TOOL_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_CLEANUP_RETRIES: u32 = 3;
pub const DEFAULT_CLEANUP_BACKOFF: Duration = Duration::from_secs(1);

pub const DEFAULT_MIC_GAIN: f32 = 1.0;
pub const DEFAULT_SYSTEM_GAIN: f32 = 1.2;
pub const DEFAULT_NOISE_FLOOR: f32 = 0.02;
pub const DEFAULT_SOURCE_BUFFER_MS: u64 = 2_000;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_IDLE_BACKOFF: Duration = Duration::from_millis(50);
pub const DEFAULT_SINGLE_QUANTUM_MS: u64 = 100;
pub const DEFAULT_DUAL_QUANTUM_MS: u64 = 10;

pub(super) const MIN_FRAMERATE: u32 = 1;
pub(super) const MAX_FRAMERATE: u32 = 120;
pub(super) const MIN_TIMEOUT_MS: u64 = 1_000;
pub(super) const MAX_STOP_TIMEOUT_MS: u64 = 120_000;
pub(super) const MAX_TOOL_TIMEOUT_MS: u64 = 600_000;
pub(super) const MAX_CLEANUP_RETRIES: u32 = 10;
pub(super) const MAX_DEVICE_NAME_LEN: usize = 256;
// Device names end up in ffmpeg argv and in dshow/pulse specifiers.
pub(super) const FORBIDDEN_DEVICE_CHARS: &[char] =
    &[';', '|', '&', '$', '`', '<', '>', '\\', '\'', '"'];

/// Written and removed again to prove the output folder is writable.
pub(super) const WRITE_PROBE_FILE: &str = "test_write.txt";
pub(super) const RECORDING_FILE_FORMAT: &str = "Recording_%Y%m%d_%H%M%S.mp4";
