use super::StreamFormat;
use crate::log_debug;
#[cfg(feature = "high-quality-audio")]
use anyhow::anyhow;
use anyhow::{bail, Result};
#[cfg(feature = "high-quality-audio")]
use rubato::{InterpolationParameters, InterpolationType, Resampler, SincFixedIn, WindowFunction};
use std::f32::consts::PI;
#[cfg(feature = "high-quality-audio")]
use std::sync::atomic::{AtomicBool, Ordering};

// Practical device rate bounds; conversions to or from anything outside fail.
pub(super) const MIN_STREAM_RATE: u32 = 2_000;
pub(super) const MAX_STREAM_RATE: u32 = 1_600_000;
const MAX_DOWNSAMPLING_TAPS: usize = 129;
#[cfg(feature = "high-quality-audio")]
const SINC_CHUNK_FRAMES: usize = 1024;

#[cfg(feature = "high-quality-audio")]
static RESAMPLER_WARNING_SHOWN: AtomicBool = AtomicBool::new(false);

/// Streaming converter from any device format to a target format.
///
/// Channel mapping happens first (mono is duplicated, wider layouts keep the
/// front pair), then rate conversion. Partial frames and resampler state carry
/// across `process` calls, and `flush` trims or pads the tail so the total
/// output frame count is `round(frames_in * target_rate / source_rate)`.
pub struct SampleConverter {
    source: StreamFormat,
    target: StreamFormat,
    partial: Vec<f32>,
    stage: RateStage,
    frames_in: u64,
    frames_out: u64,
}

enum RateStage {
    Passthrough,
    Linear(LinearStage),
    #[cfg(feature = "high-quality-audio")]
    Sinc(SincStage),
}

impl SampleConverter {
    /// Fails when the rates differ and either is outside the supported range,
    /// so nothing unconverted can reach a file written in `target` format.
    pub fn new(source: StreamFormat, target: StreamFormat) -> Result<Self> {
        let (src, dst) = (source.sample_rate, target.sample_rate);
        if src != dst && !(rate_supported(src) && rate_supported(dst)) {
            bail!(
                "unsupported sample rate conversion {src}Hz -> {dst}Hz \
                 (supported {MIN_STREAM_RATE}..={MAX_STREAM_RATE}Hz)"
            );
        }
        if source.channels == 0 || target.channels == 0 {
            bail!("stream format without channels: {source} -> {target}");
        }
        Ok(Self {
            source,
            target,
            partial: Vec::new(),
            stage: build_stage(source, target),
            frames_in: 0,
            frames_out: 0,
        })
    }

    /// True when no channel or rate work is needed.
    pub fn is_passthrough(&self) -> bool {
        self.source.channels == self.target.channels && matches!(self.stage, RateStage::Passthrough)
    }

    /// Convert one block of interleaved source samples. Output may lag the
    /// input by a few frames while the resampler fills its window.
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        let src_channels = usize::from(self.source.channels.max(1));
        let dst_channels = usize::from(self.target.channels.max(1));

        let joined;
        let data: &[f32] = if self.partial.is_empty() {
            input
        } else {
            let mut buf = std::mem::take(&mut self.partial);
            buf.extend_from_slice(input);
            joined = buf;
            &joined
        };
        let whole = data.len() / src_channels * src_channels;
        let (frames, rest) = data.split_at(whole);
        self.partial = rest.to_vec();
        if frames.is_empty() {
            return Vec::new();
        }

        let mapped = map_channels(frames, src_channels, dst_channels);
        self.frames_in += (mapped.len() / dst_channels) as u64;
        let out = self.run_stage(mapped);
        self.frames_out += (out.len() / dst_channels) as u64;
        out
    }

    /// Emit everything still held by the resampler and reset for reuse.
    pub fn flush(&mut self) -> Vec<f32> {
        let dst_channels = usize::from(self.target.channels.max(1));
        if !self.partial.is_empty() {
            log_debug(&format!(
                "sample converter dropped {} samples of an incomplete frame",
                self.partial.len()
            ));
            self.partial.clear();
        }

        let mut tail = match &mut self.stage {
            RateStage::Passthrough => Vec::new(),
            RateStage::Linear(stage) => stage.flush(),
            #[cfg(feature = "high-quality-audio")]
            RateStage::Sinc(stage) => stage.flush().unwrap_or_else(|err| {
                log_debug(&format!("sinc resampler flush failed: {err}"));
                Vec::new()
            }),
        };

        let remaining = self.expected_frames().saturating_sub(self.frames_out) as usize;
        tail.resize(remaining * dst_channels, 0.0);

        self.stage = build_stage(self.source, self.target);
        self.frames_in = 0;
        self.frames_out = 0;
        tail
    }

    fn expected_frames(&self) -> u64 {
        let (src, dst) = (
            u64::from(self.source.sample_rate),
            u64::from(self.target.sample_rate),
        );
        if matches!(self.stage, RateStage::Passthrough) || src == 0 {
            return self.frames_in;
        }
        (self.frames_in * dst + src / 2) / src
    }

    fn run_stage(&mut self, mapped: Vec<f32>) -> Vec<f32> {
        match &mut self.stage {
            RateStage::Passthrough => mapped,
            RateStage::Linear(stage) => stage.process(&mapped),
            #[cfg(feature = "high-quality-audio")]
            RateStage::Sinc(stage) => match stage.process(&mapped) {
                Ok(out) => out,
                Err(err) => {
                    if !RESAMPLER_WARNING_SHOWN.swap(true, Ordering::AcqRel) {
                        log_debug(&format!(
                            "high-quality resampler failed ({err}); falling back to basic path"
                        ));
                    }
                    let mut linear = LinearStage::new(self.source.sample_rate, self.target);
                    let out = linear.process(&mapped);
                    self.stage = RateStage::Linear(linear);
                    out
                }
            },
        }
    }

    #[cfg(all(test, feature = "high-quality-audio"))]
    pub(super) fn force_sinc_failure(&mut self) {
        if let RateStage::Sinc(stage) = &mut self.stage {
            stage.fail_next = true;
        }
    }

    #[cfg(test)]
    pub(super) fn uses_linear_stage(&self) -> bool {
        matches!(self.stage, RateStage::Linear(_))
    }
}

/// One-shot conversion of a complete buffer.
pub fn convert_interleaved(
    input: &[f32],
    source: StreamFormat,
    target: StreamFormat,
) -> Result<Vec<f32>> {
    let mut converter = SampleConverter::new(source, target)?;
    let mut out = converter.process(input);
    out.extend(converter.flush());
    Ok(out)
}

/// Rates are validated by `SampleConverter::new`.
fn build_stage(source: StreamFormat, target: StreamFormat) -> RateStage {
    let (src, dst) = (source.sample_rate, target.sample_rate);
    if src == dst {
        return RateStage::Passthrough;
    }

    #[cfg(feature = "high-quality-audio")]
    {
        match SincStage::new(src, target) {
            Ok(stage) => return RateStage::Sinc(stage),
            Err(err) => {
                if !RESAMPLER_WARNING_SHOWN.swap(true, Ordering::AcqRel) {
                    log_debug(&format!(
                        "high-quality resampler unavailable ({err}); using basic path"
                    ));
                }
            }
        }
    }

    RateStage::Linear(LinearStage::new(src, target))
}

fn rate_supported(rate: u32) -> bool {
    (MIN_STREAM_RATE..=MAX_STREAM_RATE).contains(&rate)
}

/// Map interleaved frames from `src` to `dst` channels.
pub(super) fn map_channels(input: &[f32], src: usize, dst: usize) -> Vec<f32> {
    if src == dst {
        return input.to_vec();
    }
    let mut out = Vec::with_capacity(input.len() / src * dst);
    for frame in input.chunks_exact(src) {
        if src == 1 {
            out.extend(std::iter::repeat(frame[0]).take(dst));
        } else if dst == 1 {
            out.push(frame.iter().sum::<f32>() / src as f32);
        } else {
            out.extend((0..dst).map(|ch| frame.get(ch).copied().unwrap_or(0.0)));
        }
    }
    out
}

#[cfg(feature = "high-quality-audio")]
struct SincStage {
    resampler: SincFixedIn<f32>,
    channels: usize,
    pending: Vec<Vec<f32>>,
    #[cfg(test)]
    fail_next: bool,
}

#[cfg(feature = "high-quality-audio")]
impl SincStage {
    fn new(source_rate: u32, target: StreamFormat) -> Result<Self> {
        let channels = usize::from(target.channels.max(1));
        let ratio = f64::from(target.sample_rate) / f64::from(source_rate);
        let params = InterpolationParameters {
            sinc_len: 64,
            f_cutoff: 0.90,
            interpolation: InterpolationType::Cubic,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };
        //                                   ratio,  drift, params, chunk_size, channels
        let resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, SINC_CHUNK_FRAMES, channels)
            .map_err(|e| anyhow!("failed to construct sinc resampler: {e:?}"))?;
        Ok(Self {
            resampler,
            channels,
            pending: vec![Vec::with_capacity(SINC_CHUNK_FRAMES * 2); channels],
            #[cfg(test)]
            fail_next: false,
        })
    }

    fn process(&mut self, interleaved: &[f32]) -> Result<Vec<f32>> {
        for frame in interleaved.chunks_exact(self.channels) {
            for (ch, sample) in frame.iter().enumerate() {
                self.pending[ch].push(*sample);
            }
        }
        let mut out = Vec::new();
        while self.pending[0].len() >= SINC_CHUNK_FRAMES {
            let block: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|ch| ch.drain(..SINC_CHUNK_FRAMES).collect())
                .collect();
            self.run_block(&block, &mut out)?;
        }
        Ok(out)
    }

    /// Pad the remainder with silence and push one extra silent block so the
    /// sinc window releases its delayed tail.
    fn flush(&mut self) -> Result<Vec<f32>> {
        let mut out = Vec::new();
        let mut blocks = Vec::with_capacity(2);
        if !self.pending[0].is_empty() {
            let block: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|ch| {
                    let mut chunk = std::mem::take(ch);
                    chunk.resize(SINC_CHUNK_FRAMES, 0.0);
                    chunk
                })
                .collect();
            blocks.push(block);
        }
        blocks.push(vec![vec![0.0; SINC_CHUNK_FRAMES]; self.channels]);
        for block in blocks {
            self.run_block(&block, &mut out)?;
        }
        Ok(out)
    }

    fn run_block(&mut self, block: &[Vec<f32>], out: &mut Vec<f32>) -> Result<()> {
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next) {
            return Err(anyhow!("forced rubato error"));
        }
        let produced = self
            .resampler
            .process(block, None)
            .map_err(|e| anyhow!("resampler process failed: {e:?}"))?;
        let frames = produced.first().map(Vec::len).unwrap_or(0);
        out.reserve(frames * self.channels);
        for idx in 0..frames {
            for channel in &produced {
                out.push(channel.get(idx).copied().unwrap_or(0.0));
            }
        }
        Ok(())
    }
}

/// FIR low-pass (when decimating) followed by linear interpolation. Output
/// positions are computed from integer frame indices so long streams do not
/// accumulate drift.
struct LinearStage {
    channels: usize,
    source_rate: u64,
    target_rate: u64,
    lowpass: Option<FirStage>,
    pending: Vec<f32>,
    base: u64,
    next_out: u64,
}

impl LinearStage {
    fn new(source_rate: u32, target: StreamFormat) -> Self {
        let channels = usize::from(target.channels.max(1));
        let lowpass = (source_rate > target.sample_rate).then(|| {
            let taps = downsampling_tap_count(source_rate, target.sample_rate);
            FirStage::new(source_rate, target.sample_rate, taps, channels)
        });
        Self {
            channels,
            source_rate: u64::from(source_rate),
            target_rate: u64::from(target.sample_rate),
            lowpass,
            pending: Vec::new(),
            base: 0,
            next_out: 0,
        }
    }

    fn process(&mut self, input: &[f32]) -> Vec<f32> {
        match self.lowpass.as_mut() {
            Some(fir) => {
                let filtered = fir.process(input);
                self.pending.extend_from_slice(&filtered);
            }
            None => self.pending.extend_from_slice(input),
        }
        self.emit(false)
    }

    fn flush(&mut self) -> Vec<f32> {
        if let Some(fir) = self.lowpass.as_mut() {
            let tail = fir.flush();
            self.pending.extend_from_slice(&tail);
        }
        self.emit(true)
    }

    fn emit(&mut self, last: bool) -> Vec<f32> {
        let ch = self.channels;
        let frames = self.pending.len() / ch;
        let mut out = Vec::new();
        loop {
            let pos = self.next_out * self.source_rate;
            let idx = pos / self.target_rate;
            let frac = (pos % self.target_rate) as f32 / self.target_rate as f32;
            let local = (idx - self.base) as usize;
            if local + 1 < frames {
                let a = &self.pending[local * ch..(local + 1) * ch];
                let b = &self.pending[(local + 1) * ch..(local + 2) * ch];
                out.extend(a.iter().zip(b).map(|(x, y)| x * (1.0 - frac) + y * frac));
            } else if last && local < frames {
                out.extend_from_slice(&self.pending[local * ch..(local + 1) * ch]);
            } else {
                break;
            }
            self.next_out += 1;
        }

        let keep_from = self.next_out * self.source_rate / self.target_rate;
        let consumed = (keep_from - self.base).min(frames as u64) as usize;
        self.pending.drain(..consumed * ch);
        self.base += consumed as u64;
        out
    }
}

/// Causal Hamming-windowed sinc low-pass with per-channel history. The group
/// delay is hidden by skipping the first `delay` frames and feeding the same
/// number of silent frames on flush.
struct FirStage {
    coeffs: Vec<f32>,
    channels: usize,
    history: Vec<f32>,
    skip: usize,
    delay: usize,
}

impl FirStage {
    fn new(source_rate: u32, target_rate: u32, taps: usize, channels: usize) -> Self {
        let normalized_cutoff = (target_rate as f32 * 0.5 / source_rate as f32).min(0.499);
        let coeffs = design_low_pass(normalized_cutoff, taps);
        let delay = taps / 2;
        Self {
            history: vec![0.0; taps.saturating_sub(1) * channels],
            coeffs,
            channels,
            skip: delay,
            delay,
        }
    }

    fn process(&mut self, input: &[f32]) -> Vec<f32> {
        let ch = self.channels;
        let taps = self.coeffs.len();
        let mut window = std::mem::take(&mut self.history);
        window.extend_from_slice(input);
        let frames = input.len() / ch;
        let mut out = Vec::with_capacity(input.len());
        for n in 0..frames {
            for c in 0..ch {
                let acc: f32 = self
                    .coeffs
                    .iter()
                    .enumerate()
                    .map(|(k, coeff)| window[(n + k) * ch + c] * coeff)
                    .sum();
                out.push(acc);
            }
        }
        let keep = taps.saturating_sub(1) * ch;
        self.history = window[window.len() - keep..].to_vec();

        let skip = self.skip.min(frames);
        self.skip -= skip;
        out.drain(..skip * ch);
        out
    }

    fn flush(&mut self) -> Vec<f32> {
        let silence = vec![0.0; self.delay * self.channels];
        self.process(&silence)
    }
}

/// Pick a tap count from the decimation ratio so the FIR stays short for
/// near-equal rates and grows when collapsing high device rates.
pub(super) fn downsampling_tap_count(source_rate: u32, target_rate: u32) -> usize {
    let decimation_ratio = source_rate as f32 / target_rate.max(1) as f32;
    let mut taps = (decimation_ratio * 4.0).ceil().max(11.0) as usize;
    if taps.is_multiple_of(2) {
        taps += 1;
    }
    taps.min(MAX_DOWNSAMPLING_TAPS)
}

/// Build the normalized Hamming-windowed sinc taps used by the FIR filter.
pub(super) fn design_low_pass(normalized_cutoff: f32, taps: usize) -> Vec<f32> {
    let mut coeffs = Vec::with_capacity(taps);
    let m = (taps.max(1) - 1) as f32;

    for n in 0..taps {
        let centered = n as f32 - m / 2.0;
        let x = 2.0 * PI * normalized_cutoff * centered;
        let sinc = if centered == 0.0 {
            2.0 * normalized_cutoff
        } else {
            (2.0 * normalized_cutoff * x.sin()) / x
        };
        let window = if taps <= 1 {
            1.0
        } else {
            0.54 - 0.46 * ((2.0 * PI * n as f32) / m).cos()
        };
        coeffs.push(sinc * window);
    }

    let sum: f32 = coeffs.iter().sum();
    if sum != 0.0 {
        for coeff in coeffs.iter_mut() {
            *coeff /= sum;
        }
    }

    coeffs
}
