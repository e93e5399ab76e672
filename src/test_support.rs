//! In-process stand-ins for devices, the screen recorder and ffmpeg.

use crate::audio::{
    ActiveCapture, AudioBackend, CaptureSink, EndpointInventory, SinkFactory, SourceRole,
    StreamFormat,
};
use crate::error::RecorderError;
use crate::media::{
    DurationProbe, FinishOutcome, MediaTool, MuxedAudioInput, VideoRecording, VideoTrackProducer,
};
use anyhow::{anyhow, Context, Result};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Sink slot shared by the fake backend and its capture; emptied on stop so
/// the sink drops the way a closed device stream would drop it.
type SharedSink = Arc<Mutex<Option<CaptureSink>>>;

/// Audio backend whose "devices" are sinks the test feeds by hand.
#[derive(Default)]
pub(crate) struct FakeAudioBackend {
    formats: Mutex<HashMap<SourceRole, StreamFormat>>,
    preload: Mutex<HashMap<SourceRole, Vec<Vec<f32>>>>,
    missing: Mutex<HashSet<SourceRole>>,
    sinks: Mutex<Vec<(SourceRole, SharedSink)>>,
    stopped: Arc<AtomicUsize>,
}

impl FakeAudioBackend {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set_format(&self, role: SourceRole, format: StreamFormat) {
        self.formats.lock().unwrap().insert(role, format);
    }

    /// Blocks delivered as soon as the device opens.
    pub(crate) fn preload(&self, role: SourceRole, blocks: Vec<Vec<f32>>) {
        self.preload.lock().unwrap().insert(role, blocks);
    }

    pub(crate) fn remove_device(&self, role: SourceRole) {
        self.missing.lock().unwrap().insert(role);
    }

    /// Deliver to the most recently opened sink for `role`. Blocks sent to a
    /// stopped device are lost, as with real hardware.
    pub(crate) fn deliver(&self, role: SourceRole, samples: &[f32]) {
        let slot = self
            .sinks
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(r, _)| *r == role)
            .map(|(_, slot)| Arc::clone(slot))
            .expect("device never opened");
        if let Some(sink) = slot.lock().unwrap().as_mut() {
            sink.deliver(samples);
        };
    }

    pub(crate) fn opened(&self) -> usize {
        self.sinks.lock().unwrap().len()
    }

    pub(crate) fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl AudioBackend for FakeAudioBackend {
    fn endpoints(&self) -> Result<EndpointInventory> {
        Ok(EndpointInventory {
            render: vec!["Fake Speakers".to_string()],
            capture: vec!["Fake Mic".to_string()],
            default_render: Some("Fake Speakers".to_string()),
            default_capture: Some("Fake Mic".to_string()),
        })
    }

    fn open(
        &self,
        role: SourceRole,
        device: Option<&str>,
        sink_for: &mut SinkFactory<'_>,
    ) -> Result<Box<dyn ActiveCapture>, RecorderError> {
        if self.missing.lock().unwrap().contains(&role) {
            let name = device.unwrap_or("default").to_string();
            return Err(RecorderError::DeviceNotFound { role, name });
        }
        let format = self
            .formats
            .lock()
            .unwrap()
            .get(&role)
            .copied()
            .unwrap_or_else(StreamFormat::capture);
        let mut sink = sink_for(format);
        if let Some(blocks) = self.preload.lock().unwrap().get(&role) {
            for block in blocks {
                sink.deliver(block);
            }
        }
        let slot: SharedSink = Arc::new(Mutex::new(Some(sink)));
        self.sinks.lock().unwrap().push((role, Arc::clone(&slot)));
        Ok(Box::new(FakeCapture {
            format,
            slot,
            stopped: Arc::clone(&self.stopped),
        }))
    }
}

struct FakeCapture {
    format: StreamFormat,
    slot: SharedSink,
    stopped: Arc<AtomicUsize>,
}

impl ActiveCapture for FakeCapture {
    fn format(&self) -> StreamFormat {
        self.format
    }

    fn stop(self: Box<Self>) {
        self.slot.lock().unwrap().take();
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Screen recorder writing `dur=<secs>` into each segment file on finish.
#[derive(Default)]
pub(crate) struct FakeVideo {
    fixed_secs: Option<f64>,
    startup_delay: Duration,
    empty_calls: Mutex<HashSet<usize>>,
    failing_calls: Mutex<HashSet<usize>>,
    calls: AtomicUsize,
    muxed: Mutex<Vec<Option<MuxedAudioInput>>>,
}

impl FakeVideo {
    /// Every segment reports `secs` of video regardless of wall time.
    pub(crate) fn fixed(secs: f64) -> Arc<Self> {
        Arc::new(Self {
            fixed_secs: Some(secs),
            ..Self::default()
        })
    }

    /// Like `fixed`, but `begin` only returns after the recording has been
    /// running for `delay`, the way ffmpeg's startup check does.
    pub(crate) fn fixed_with_startup(secs: f64, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            fixed_secs: Some(secs),
            startup_delay: delay,
            ..Self::default()
        })
    }

    /// The `call`-th begin (zero based) produces an empty file.
    pub(crate) fn leave_empty(&self, call: usize) {
        self.empty_calls.lock().unwrap().insert(call);
    }

    pub(crate) fn fail_begin(&self, call: usize) {
        self.failing_calls.lock().unwrap().insert(call);
    }

    pub(crate) fn begins(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn muxed_inputs(&self) -> Vec<Option<MuxedAudioInput>> {
        self.muxed.lock().unwrap().clone()
    }
}

impl VideoTrackProducer for FakeVideo {
    fn begin(
        &self,
        path: &Path,
        muxed_audio: Option<&MuxedAudioInput>,
    ) -> Result<Box<dyn VideoRecording>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_calls.lock().unwrap().contains(&call) {
            return Err(anyhow!("screen grabber refused to start"));
        }
        self.muxed.lock().unwrap().push(muxed_audio.cloned());
        let recording = FakeRecording {
            path: path.to_path_buf(),
            started: Instant::now(),
            fixed_secs: self.fixed_secs,
            empty: self.empty_calls.lock().unwrap().contains(&call),
        };
        std::thread::sleep(self.startup_delay);
        Ok(Box::new(recording))
    }
}

struct FakeRecording {
    path: PathBuf,
    started: Instant,
    fixed_secs: Option<f64>,
    empty: bool,
}

impl VideoRecording for FakeRecording {
    fn path(&self) -> &Path {
        &self.path
    }

    fn finish(self: Box<Self>, _timeout: Duration) -> Result<FinishOutcome> {
        let body = if self.empty {
            String::new()
        } else {
            let secs = self
                .fixed_secs
                .unwrap_or_else(|| self.started.elapsed().as_secs_f64());
            format!("dur={secs:.3}\n")
        };
        fs::write(&self.path, body)?;
        Ok(FinishOutcome {
            forced: false,
            exit_ok: true,
        })
    }
}

/// WAV files are measured with hound; anything else sums its `dur=` lines.
#[derive(Default)]
pub(crate) struct FakeProbe;

impl DurationProbe for FakeProbe {
    fn duration_secs(&self, path: &Path) -> Result<f64> {
        let bytes = fs::read(path).with_context(|| format!("probe {}", path.display()))?;
        if bytes.starts_with(b"RIFF") {
            return wav_secs(path);
        }
        let text = String::from_utf8_lossy(&bytes);
        let durations: Vec<f64> = text
            .lines()
            .filter_map(|line| line.strip_prefix("dur="))
            .filter_map(|raw| raw.trim().parse().ok())
            .collect();
        if durations.is_empty() {
            return Err(anyhow!("no duration in {}", path.display()));
        }
        Ok(durations.iter().sum())
    }
}

pub(crate) fn wav_secs(path: &Path) -> Result<f64> {
    let reader = hound::WavReader::open(path)?;
    Ok(f64::from(reader.duration()) / f64::from(reader.spec().sample_rate))
}

pub(crate) fn wav_samples(path: &Path) -> Vec<i16> {
    hound::WavReader::open(path)
        .expect("open wav")
        .into_samples::<i16>()
        .map(|s| s.expect("sample"))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MuxCall {
    pub offset: f64,
    pub audio_secs: f64,
}

/// ffmpeg stand-in: concat joins file bodies, mux copies the video and
/// records what it was asked to do.
#[derive(Default)]
pub(crate) struct FakeTool {
    unavailable: bool,
    fail_mux: bool,
    concat_inputs: Mutex<Vec<Vec<PathBuf>>>,
    mux_calls: Mutex<Vec<MuxCall>>,
}

impl FakeTool {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn unavailable() -> Arc<Self> {
        Arc::new(Self {
            unavailable: true,
            ..Self::default()
        })
    }

    pub(crate) fn failing_mux() -> Arc<Self> {
        Arc::new(Self {
            fail_mux: true,
            ..Self::default()
        })
    }

    pub(crate) fn concat_inputs(&self) -> Vec<Vec<PathBuf>> {
        self.concat_inputs.lock().unwrap().clone()
    }

    pub(crate) fn mux_calls(&self) -> Vec<MuxCall> {
        self.mux_calls.lock().unwrap().clone()
    }
}

fn manifest_entries(manifest: &Path) -> Result<Vec<PathBuf>> {
    let text = fs::read_to_string(manifest)?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            line.strip_prefix("file '")
                .and_then(|rest| rest.strip_suffix('\''))
                .map(|raw| PathBuf::from(raw.replace("'\\''", "'")))
                .ok_or_else(|| anyhow!("bad manifest line: {line}"))
        })
        .collect()
}

impl MediaTool for FakeTool {
    fn check_available(&self) -> Result<(), RecorderError> {
        if self.unavailable {
            return Err(RecorderError::ToolUnavailable("fake ffmpeg missing".into()));
        }
        Ok(())
    }

    fn concat_video(&self, manifest: &Path, output: &Path) -> Result<()> {
        let inputs = manifest_entries(manifest)?;
        let mut joined = Vec::new();
        for input in &inputs {
            joined.extend(fs::read(input).with_context(|| format!("read {}", input.display()))?);
        }
        fs::write(output, joined)?;
        self.concat_inputs.lock().unwrap().push(inputs);
        Ok(())
    }

    fn mux(&self, video: &Path, audio: &Path, audio_offset_secs: f64, output: &Path) -> Result<()> {
        if self.fail_mux {
            return Err(anyhow!("fake mux failure"));
        }
        let audio_secs = wav_secs(audio)?;
        let mut body = fs::read(video)?;
        body.extend(format!("audio={audio_secs:.3} offset={audio_offset_secs:.2}\n").bytes());
        fs::write(output, body)?;
        self.mux_calls.lock().unwrap().push(MuxCall {
            offset: audio_offset_secs,
            audio_secs,
        });
        Ok(())
    }
}

/// Interleaved block of `frames` frames with every sample at `value`.
pub(crate) fn constant_block(frames: usize, channels: u16, value: f32) -> Vec<f32> {
    vec![value; frames * usize::from(channels)]
}

/// Poll `check` until it holds or `timeout` passes.
pub(crate) fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}
