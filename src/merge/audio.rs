//! Joins segment WAVs into one capture-format track.

use crate::audio::{
    capture_wav_spec, to_pcm16, SampleConverter, StreamFormat, CAPTURE_CHANNELS, CAPTURE_RATE,
};
use crate::log_debug;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

const READ_BLOCK_MS: u64 = 100;

pub(super) struct AudioAssembler {
    writer: hound::WavWriter<BufWriter<File>>,
    frames: u64,
}

impl AudioAssembler {
    pub(super) fn create(path: &Path) -> Result<Self> {
        let writer = hound::WavWriter::create(path, capture_wav_spec())
            .with_context(|| format!("failed to create {}", path.display()))?;
        Ok(Self { writer, frames: 0 })
    }

    pub(super) fn duration_secs(&self) -> f64 {
        self.frames as f64 / f64::from(CAPTURE_RATE)
    }

    /// Append one segment file, converting it to the capture format. A read
    /// error part way through keeps what was read and stops at that point.
    pub(super) fn append_file(&mut self, path: &Path) -> Result<u64> {
        let mut reader = hound::WavReader::open(path)
            .with_context(|| format!("failed to open segment audio {}", path.display()))?;
        let spec = reader.spec();
        let format = StreamFormat::new(spec.sample_rate, spec.channels);
        let mut converter = SampleConverter::new(format, StreamFormat::capture())
            .with_context(|| format!("cannot convert segment audio {}", path.display()))?;
        let block_len = format.samples_for_millis(READ_BLOCK_MS);
        let before = self.frames;

        match (spec.sample_format, spec.bits_per_sample) {
            (hound::SampleFormat::Float, _) => {
                self.pump(path, reader.samples::<f32>(), |s| s, &mut converter, block_len)?
            }
            (hound::SampleFormat::Int, bits) if bits <= 16 => {
                let scale = (1i32 << (bits.max(1) - 1)) as f32;
                self.pump(
                    path,
                    reader.samples::<i16>(),
                    |s| f32::from(s) / scale,
                    &mut converter,
                    block_len,
                )?
            }
            (hound::SampleFormat::Int, bits) => {
                let scale = (1i64 << (bits.min(32) - 1)) as f32;
                self.pump(
                    path,
                    reader.samples::<i32>(),
                    |s| s as f32 / scale,
                    &mut converter,
                    block_len,
                )?
            }
        }
        Ok(self.frames - before)
    }

    fn pump<S, I, F>(
        &mut self,
        path: &Path,
        samples: I,
        normalize: F,
        converter: &mut SampleConverter,
        block_len: usize,
    ) -> Result<()>
    where
        I: Iterator<Item = hound::Result<S>>,
        F: Fn(S) -> f32,
    {
        let mut block = Vec::with_capacity(block_len);
        for sample in samples {
            match sample {
                Ok(value) => block.push(normalize(value)),
                Err(err) => {
                    log_debug(&format!(
                        "stopped reading {} after a decode error: {err}",
                        path.display()
                    ));
                    break;
                }
            }
            if block.len() == block_len {
                let converted = converter.process(&block);
                self.write(&converted)?;
                block.clear();
            }
        }
        if !block.is_empty() {
            let converted = converter.process(&block);
            self.write(&converted)?;
        }
        let tail = converter.flush();
        self.write(&tail)
    }

    pub(super) fn append_silence(&mut self, secs: f64) -> Result<u64> {
        if secs <= 0.0 {
            return Ok(0);
        }
        let frames = (secs * f64::from(CAPTURE_RATE)).round() as u64;
        for _ in 0..frames * u64::from(CAPTURE_CHANNELS) {
            self.writer.write_sample(0i16)?;
        }
        self.frames += frames;
        Ok(frames)
    }

    fn write(&mut self, samples: &[f32]) -> Result<()> {
        for sample in samples {
            self.writer.write_sample(to_pcm16(*sample))?;
        }
        self.frames += (samples.len() / usize::from(CAPTURE_CHANNELS)) as u64;
        Ok(())
    }

    pub(super) fn finalize(self) -> Result<()> {
        self.writer
            .finalize()
            .context("failed to finalize merged audio")
    }
}
