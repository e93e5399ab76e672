//! Segment audio worker: drains the source buffers, mixes and writes the WAV.

use super::buffer::{SourceBuffer, SourceReader};
use super::capture::{ActiveCapture, AudioBackend, CaptureSink};
use super::gate::{SilenceGate, DEFAULT_GATE_THRESHOLD};
use super::resample::SampleConverter;
use super::{
    capture_wav_spec, to_pcm16, AudioSourceKind, SourceRole, StreamFormat, CAPTURE_CHANNELS,
    CAPTURE_RATE,
};
use crate::config::defaults;
use crate::error::RecorderError;
use crate::log_debug;
use anyhow::{anyhow, Context, Result};
use crossbeam_channel::bounded;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Tunables for one segment's audio worker.
#[derive(Debug, Clone)]
pub struct MixerConfig {
    pub gate_threshold: f32,
    pub mic_gain: f32,
    pub system_gain: f32,
    /// Per-sample magnitude at or below which a sample is treated as silence
    /// before mixing.
    pub noise_floor: f32,
    pub buffer_ms: u64,
    pub poll_interval: Duration,
    pub idle_backoff: Duration,
    pub single_quantum_ms: u64,
    pub dual_quantum_ms: u64,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            gate_threshold: DEFAULT_GATE_THRESHOLD,
            mic_gain: defaults::DEFAULT_MIC_GAIN,
            system_gain: defaults::DEFAULT_SYSTEM_GAIN,
            noise_floor: defaults::DEFAULT_NOISE_FLOOR,
            buffer_ms: defaults::DEFAULT_SOURCE_BUFFER_MS,
            poll_interval: defaults::DEFAULT_POLL_INTERVAL,
            idle_backoff: defaults::DEFAULT_IDLE_BACKOFF,
            single_quantum_ms: defaults::DEFAULT_SINGLE_QUANTUM_MS,
            dual_quantum_ms: defaults::DEFAULT_DUAL_QUANTUM_MS,
        }
    }
}

/// Mix one microphone sample with one system sample:
/// noise floor, then gain, then sum / 2, then clamp.
pub fn mix_sample(mic: f32, system: f32, config: &MixerConfig) -> f32 {
    let floor = |x: f32| if x.abs() <= config.noise_floor { 0.0 } else { x };
    ((floor(mic) * config.mic_gain + floor(system) * config.system_gain) / 2.0).clamp(-1.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WriterPhase {
    Idle = 0,
    Capturing = 1,
    Draining = 2,
    Closed = 3,
}

impl WriterPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => WriterPhase::Idle,
            1 => WriterPhase::Capturing,
            2 => WriterPhase::Draining,
            _ => WriterPhase::Closed,
        }
    }
}

/// Endpoint names per role; `None` picks the system default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSelection {
    pub microphone: Option<String>,
    pub system: Option<String>,
}

impl DeviceSelection {
    pub fn for_role(&self, role: SourceRole) -> Option<&str> {
        match role {
            SourceRole::Microphone => self.microphone.as_deref(),
            SourceRole::SystemLoopback => self.system.as_deref(),
        }
    }
}

/// Result of closing one segment's audio file.
#[derive(Debug, Clone)]
pub struct AudioSegmentReport {
    pub path: PathBuf,
    pub frames_written: u64,
    pub padded_frames: u64,
    pub offset: Duration,
    pub significant: bool,
}

impl AudioSegmentReport {
    pub fn duration_secs(&self) -> f64 {
        (self.frames_written + self.padded_frames) as f64 / f64::from(CAPTURE_RATE)
    }
}

struct Shared {
    cancel: AtomicBool,
    phase: AtomicU8,
    frames_written: AtomicU64,
}

impl Shared {
    fn set_phase(&self, phase: WriterPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }
}

/// Owns the worker thread that turns captured blocks into one segment WAV.
///
/// Devices are opened on the worker itself because cpal streams cannot move
/// between threads; `start` only returns once they are open and the file
/// exists, or with the device error and nothing left behind.
pub struct MixingWriter {
    path: PathBuf,
    gate: Arc<SilenceGate>,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<Option<WorkerOutcome>>>,
}

impl MixingWriter {
    pub fn start(
        backend: Arc<dyn AudioBackend>,
        kind: AudioSourceKind,
        devices: &DeviceSelection,
        path: &Path,
        config: MixerConfig,
    ) -> Result<Self, RecorderError> {
        if kind.roles().is_empty() {
            return Err(anyhow!("audio source 'none' has nothing to capture").into());
        }
        let shared = Arc::new(Shared {
            cancel: AtomicBool::new(false),
            phase: AtomicU8::new(WriterPhase::Idle as u8),
            frames_written: AtomicU64::new(0),
        });
        let gate = Arc::new(SilenceGate::new(config.gate_threshold));
        let (ready_tx, ready_rx) = bounded::<Result<(), RecorderError>>(1);

        let job = WorkerJob {
            backend,
            kind,
            devices: devices.clone(),
            path: path.to_path_buf(),
            config,
            gate: Arc::clone(&gate),
            shared: Arc::clone(&shared),
        };
        let handle = thread::Builder::new()
            .name("deskrec-mixer".to_string())
            .spawn(move || job.run(ready_tx))
            .context("failed to spawn audio worker")?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                path: path.to_path_buf(),
                gate,
                shared,
                handle: Some(handle),
            }),
            Ok(Err(err)) => {
                let _ = handle.join();
                Err(err)
            }
            Err(_) => {
                let _ = handle.join();
                Err(anyhow!("audio worker exited before opening devices").into())
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn phase(&self) -> WriterPhase {
        WriterPhase::from_u8(self.shared.phase.load(Ordering::Acquire))
    }

    /// Capture-format frames written so far, padding excluded.
    pub fn frames_written(&self) -> u64 {
        self.shared.frames_written.load(Ordering::Relaxed)
    }

    pub fn is_significant(&self) -> bool {
        self.gate.is_significant()
    }

    /// Cancel, drain, pad to `video_duration` (seconds, offset included) and
    /// finalize the file.
    pub fn stop(mut self, video_duration: Option<f64>) -> Result<AudioSegmentReport, RecorderError> {
        self.shared.cancel.store(true, Ordering::Release);
        let handle = self
            .handle
            .take()
            .ok_or_else(|| anyhow!("audio worker already stopped"))?;
        let outcome = handle
            .join()
            .map_err(|_| anyhow!("audio worker panicked"))?
            .ok_or_else(|| anyhow!("audio worker produced no file"))?;
        let WorkerOutcome { mut wav, error } = outcome;

        let offset = self.gate.offset();
        let frames_written = wav.frames;
        let padded_frames = match video_duration {
            Some(video) => silence_frames_needed(video, frames_written, offset),
            None => 0,
        };
        if padded_frames > 0 {
            wav.write_silence(padded_frames)
                .context("failed to pad segment audio")?;
        }
        wav.finalize()?;
        self.shared.set_phase(WriterPhase::Closed);

        if let Some(err) = error {
            return Err(err.context("audio worker failed while writing").into());
        }

        let report = AudioSegmentReport {
            path: self.path.clone(),
            frames_written,
            padded_frames,
            offset,
            significant: self.gate.is_significant(),
        };
        tracing::info!(
            path = %report.path.display(),
            frames = report.frames_written,
            padded = report.padded_frames,
            offset_ms = report.offset.as_millis() as u64,
            significant = report.significant,
            "segment audio closed"
        );
        Ok(report)
    }
}

impl Drop for MixingWriter {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.shared.cancel.store(true, Ordering::Release);
            let _ = handle.join();
        }
    }
}

/// Frames of silence that bring `written + offset` up to `video` seconds.
pub(super) fn silence_frames_needed(video: f64, frames_written: u64, offset: Duration) -> u64 {
    let rate = f64::from(CAPTURE_RATE);
    let covered = frames_written as f64 / rate + offset.as_secs_f64();
    let missing = video - covered;
    if missing <= 0.0 {
        return 0;
    }
    (missing * rate).round() as u64
}

struct WorkerOutcome {
    wav: SegmentWav,
    error: Option<anyhow::Error>,
}

/// 16-bit PCM writer in the capture format.
struct SegmentWav {
    writer: hound::WavWriter<BufWriter<File>>,
    frames: u64,
    shared: Arc<Shared>,
}

impl SegmentWav {
    fn create(path: &Path, shared: Arc<Shared>) -> Result<Self> {
        let writer = hound::WavWriter::create(path, capture_wav_spec())
            .with_context(|| format!("failed to create segment audio {}", path.display()))?;
        Ok(Self {
            writer,
            frames: 0,
            shared,
        })
    }

    fn write(&mut self, samples: &[f32]) -> Result<()> {
        for sample in samples {
            self.writer.write_sample(to_pcm16(*sample))?;
        }
        let frames = (samples.len() / usize::from(CAPTURE_CHANNELS)) as u64;
        self.frames += frames;
        self.shared
            .frames_written
            .fetch_add(frames, Ordering::Relaxed);
        Ok(())
    }

    fn write_silence(&mut self, frames: u64) -> Result<()> {
        for _ in 0..frames * u64::from(CAPTURE_CHANNELS) {
            self.writer.write_sample(0i16)?;
        }
        Ok(())
    }

    fn finalize(self) -> Result<()> {
        self.writer
            .finalize()
            .context("failed to finalize segment audio")
    }
}

/// One opened capture source as seen by the worker.
struct SourceLane {
    role: SourceRole,
    capture: Option<Box<dyn ActiveCapture>>,
    reader: SourceReader,
    converter: SampleConverter,
    quantum: usize,
    scratch: Vec<f32>,
    carry: Vec<f32>,
}

impl SourceLane {
    fn ready(&self) -> bool {
        self.reader.available() >= self.quantum
    }

    /// Read one quantum and append its converted samples to `carry`.
    fn pull(&mut self) {
        self.scratch.clear();
        self.reader.read(self.quantum, &mut self.scratch);
        let converted = self.converter.process(&self.scratch);
        self.carry.extend_from_slice(&converted);
    }

    fn stop_capture(&mut self) {
        if let Some(capture) = self.capture.take() {
            capture.stop();
        }
    }

    /// Everything left for this source, converted: carried remainder, then
    /// the ring, then the spill the stopped sink handed over. Capture must
    /// already be stopped.
    fn drain_remaining(&mut self) -> Vec<f32> {
        let mut out = std::mem::take(&mut self.carry);
        self.scratch.clear();
        self.reader.read_all(&mut self.scratch);
        let spill = self.reader.take_spill();
        log_debug(&format!(
            "{} buffer: {} samples in, {} read, {} spilled at stop",
            self.role,
            self.reader.total_written(),
            self.reader.total_read(),
            spill.len()
        ));
        self.scratch.extend_from_slice(&spill);
        out.extend(self.converter.process(&self.scratch));
        out.extend(self.converter.flush());
        out
    }
}

struct WorkerJob {
    backend: Arc<dyn AudioBackend>,
    kind: AudioSourceKind,
    devices: DeviceSelection,
    path: PathBuf,
    config: MixerConfig,
    gate: Arc<SilenceGate>,
    shared: Arc<Shared>,
}

impl WorkerJob {
    fn run(
        self,
        ready: crossbeam_channel::Sender<Result<(), RecorderError>>,
    ) -> Option<WorkerOutcome> {
        let mut lanes = match self.open_lanes() {
            Ok(lanes) => lanes,
            Err(err) => {
                log_debug(&format!("audio worker failed to open devices: {err}"));
                let _ = ready.send(Err(err));
                return None;
            }
        };
        let mut wav = match SegmentWav::create(&self.path, Arc::clone(&self.shared)) {
            Ok(wav) => wav,
            Err(err) => {
                lanes.iter_mut().for_each(SourceLane::stop_capture);
                let _ = ready.send(Err(err.into()));
                return None;
            }
        };

        self.shared.set_phase(WriterPhase::Capturing);
        if ready.send(Ok(())).is_err() {
            lanes.iter_mut().for_each(SourceLane::stop_capture);
            return None;
        }

        let mut error = match lanes.as_mut_slice() {
            [single] => self.run_single(single, &mut wav).err(),
            [mic, system] => self.run_dual(mic, system, &mut wav).err(),
            _ => Some(anyhow!("unexpected source count {}", lanes.len())),
        };

        lanes.iter_mut().for_each(SourceLane::stop_capture);
        self.shared.set_phase(WriterPhase::Draining);
        if self.gate.is_significant() {
            for lane in lanes.iter_mut() {
                let rest = lane.drain_remaining();
                log_debug(&format!(
                    "draining {} unmixed samples from {}",
                    rest.len(),
                    lane.role
                ));
                if let Err(err) = wav.write(&rest) {
                    error.get_or_insert(err);
                }
            }
        }

        Some(WorkerOutcome { wav, error })
    }

    fn open_lanes(&self) -> Result<Vec<SourceLane>, RecorderError> {
        let mut lanes: Vec<SourceLane> = Vec::new();
        for &role in self.kind.roles() {
            let mut opened: Option<SourceReader> = None;
            let gate = Arc::clone(&self.gate);
            let buffer_ms = self.config.buffer_ms;
            let result = self.backend.open(
                role,
                self.devices.for_role(role),
                &mut |format: StreamFormat| {
                    let (writer, reader) =
                        SourceBuffer::with_capacity(format.samples_for_millis(buffer_ms));
                    opened = Some(reader);
                    CaptureSink::new(Arc::clone(&gate), writer)
                },
            );
            let capture = match result {
                Ok(capture) => capture,
                Err(err) => {
                    lanes.iter_mut().for_each(SourceLane::stop_capture);
                    return Err(err);
                }
            };
            let Some(reader) = opened else {
                capture.stop();
                lanes.iter_mut().for_each(SourceLane::stop_capture);
                return Err(anyhow!("{role} capture opened without a sink").into());
            };
            let format = capture.format();
            let converter = match SampleConverter::new(format, StreamFormat::capture()) {
                Ok(converter) => converter,
                Err(err) => {
                    capture.stop();
                    lanes.iter_mut().for_each(SourceLane::stop_capture);
                    return Err(RecorderError::DeviceInactive {
                        role,
                        name: self.devices.for_role(role).unwrap_or("default").to_string(),
                        detail: format!("{err:#}"),
                    });
                }
            };
            let quantum_ms = if self.kind.roles().len() > 1 {
                self.config.dual_quantum_ms
            } else {
                self.config.single_quantum_ms
            };
            lanes.push(SourceLane {
                role,
                converter,
                quantum: format.samples_for_millis(quantum_ms),
                capture: Some(capture),
                reader,
                scratch: Vec::new(),
                carry: Vec::new(),
            });
        }
        Ok(lanes)
    }

    fn cancelled(&self) -> bool {
        self.shared.cancel.load(Ordering::Acquire)
    }

    /// Sleep in poll-sized steps until every lane has a quantum buffered.
    /// Returns false on cancellation.
    fn wait_for(&self, lanes: &[&SourceLane]) -> bool {
        loop {
            if self.cancelled() {
                return false;
            }
            if lanes.iter().all(|lane| lane.ready()) {
                return true;
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    fn gate_open_or_back_off(&self) -> bool {
        if self.gate.is_significant() {
            return true;
        }
        thread::sleep(self.config.idle_backoff);
        false
    }

    fn run_single(&self, lane: &mut SourceLane, wav: &mut SegmentWav) -> Result<()> {
        while self.wait_for(&[&*lane]) {
            if !self.gate_open_or_back_off() {
                continue;
            }
            lane.pull();
            let block = std::mem::take(&mut lane.carry);
            wav.write(&block)?;
        }
        Ok(())
    }

    /// Lockstep read of both sources; only the common prefix is mixed, the
    /// longer side keeps its remainder for the next tick.
    fn run_dual(
        &self,
        mic: &mut SourceLane,
        system: &mut SourceLane,
        wav: &mut SegmentWav,
    ) -> Result<()> {
        let mut mixed = Vec::new();
        while self.wait_for(&[&*mic, &*system]) {
            if !self.gate_open_or_back_off() {
                continue;
            }
            mic.pull();
            system.pull();
            let n = mic.carry.len().min(system.carry.len());
            mixed.clear();
            mixed.extend(
                mic.carry[..n]
                    .iter()
                    .zip(&system.carry[..n])
                    .map(|(m, s)| mix_sample(*m, *s, &self.config)),
            );
            mic.carry.drain(..n);
            system.carry.drain(..n);
            wav.write(&mixed)?;
        }
        Ok(())
    }
}
