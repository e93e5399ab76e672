//! Audio capture, gating, buffering and mixing for one recording segment.
//!
//! Device callbacks feed per-source ring buffers; a worker thread per segment
//! drains them, converts everything to 48 kHz stereo and appends to the
//! segment WAV once the silence gate has latched.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sample rate of every audio segment file.
pub const CAPTURE_RATE: u32 = 48_000;

/// Channel count of every audio segment file.
pub const CAPTURE_CHANNELS: u16 = 2;

mod buffer;
mod capture;
mod gate;
mod meter;
mod mixer;
mod resample;

pub use buffer::{SourceBuffer, SourceReader, SourceWriter};
pub use capture::{
    ActiveCapture, AudioBackend, CaptureSink, CpalBackend, EndpointInventory, SinkFactory,
};
pub use gate::{SilenceGate, DEFAULT_GATE_THRESHOLD};
pub use meter::peak_amplitude;
pub use mixer::{
    mix_sample, AudioSegmentReport, DeviceSelection, MixerConfig, MixingWriter, WriterPhase,
};
pub use resample::{convert_interleaved, SampleConverter};

/// Sample rate and channel count of a device or file stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl StreamFormat {
    pub const fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// The canonical segment format.
    pub const fn capture() -> Self {
        Self::new(CAPTURE_RATE, CAPTURE_CHANNELS)
    }

    /// Interleaved sample count covering `millis` of audio, rounded down to
    /// whole frames and never zero.
    pub fn samples_for_millis(&self, millis: u64) -> usize {
        let frames = (u64::from(self.sample_rate) * millis / 1000).max(1);
        frames as usize * usize::from(self.channels.max(1))
    }
}

/// WAV layout of every segment and merge intermediate: capture format as
/// 16-bit integer PCM.
pub fn capture_wav_spec() -> hound::WavSpec {
    hound::WavSpec {
        channels: CAPTURE_CHANNELS,
        sample_rate: CAPTURE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

/// Normalized float to 16-bit PCM, clamping out-of-range input.
pub fn to_pcm16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Hz/{}ch", self.sample_rate, self.channels)
    }
}

/// Which capture devices a session opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AudioSourceKind {
    #[default]
    None,
    #[value(name = "mic")]
    #[serde(rename = "mic")]
    Microphone,
    #[value(name = "system")]
    #[serde(rename = "system")]
    SystemLoopback,
    Both,
}

impl AudioSourceKind {
    /// Opened sources, microphone first. The mixer relies on this order.
    pub fn roles(self) -> &'static [SourceRole] {
        match self {
            AudioSourceKind::None => &[],
            AudioSourceKind::Microphone => &[SourceRole::Microphone],
            AudioSourceKind::SystemLoopback => &[SourceRole::SystemLoopback],
            AudioSourceKind::Both => &[SourceRole::Microphone, SourceRole::SystemLoopback],
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AudioSourceKind::None => "none",
            AudioSourceKind::Microphone => "mic",
            AudioSourceKind::SystemLoopback => "system",
            AudioSourceKind::Both => "both",
        }
    }
}

/// One opened capture source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceRole {
    Microphone,
    SystemLoopback,
}

impl SourceRole {
    pub fn label(self) -> &'static str {
        match self {
            SourceRole::Microphone => "microphone",
            SourceRole::SystemLoopback => "system audio",
        }
    }
}

impl fmt::Display for SourceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
