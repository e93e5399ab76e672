//! Device enumeration and capture streams.
//!
//! Loopback of a render endpoint and normal capture of a capture endpoint sit
//! behind one trait so the mix worker and the tests never touch cpal directly.

use super::buffer::SourceWriter;
use super::gate::SilenceGate;
use super::{SourceRole, StreamFormat};
use crate::error::RecorderError;
use crate::log_debug;
use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use std::sync::Arc;

/// Active render and capture endpoints by name, plus the system defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointInventory {
    pub render: Vec<String>,
    pub capture: Vec<String>,
    pub default_render: Option<String>,
    pub default_capture: Option<String>,
}

/// Builds the sink for a source once its native format is known.
pub type SinkFactory<'a> = dyn FnMut(StreamFormat) -> CaptureSink + 'a;

pub trait AudioBackend: Send + Sync {
    fn endpoints(&self) -> Result<EndpointInventory>;

    /// Open `role` on the named endpoint, or the system default when `device`
    /// is `None`, and start delivering blocks into the sink the factory builds.
    fn open(
        &self,
        role: SourceRole,
        device: Option<&str>,
        sink_for: &mut SinkFactory<'_>,
    ) -> Result<Box<dyn ActiveCapture>, RecorderError>;
}

/// A running capture stream. Dropping it without `stop` also ends capture.
pub trait ActiveCapture {
    fn format(&self) -> StreamFormat;
    /// End capture and drop the sink, which hands its spill to the reader.
    fn stop(self: Box<Self>);
}

/// What a capture callback writes into: the shared gate in front of the
/// source's ring buffer. Blocks that arrive while the gate is closed are
/// discarded, not buffered. Owned by the callback; nothing else touches it.
pub struct CaptureSink {
    gate: Arc<SilenceGate>,
    writer: SourceWriter,
}

impl CaptureSink {
    pub fn new(gate: Arc<SilenceGate>, writer: SourceWriter) -> Self {
        Self { gate, writer }
    }

    pub fn deliver(&mut self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        if self.gate.observe(samples) {
            self.writer.push(samples);
        }
    }
}

/// cpal-backed devices. Loopback opens an input stream on an output device,
/// which WASAPI supports directly; on hosts without that, monitor sources show
/// up as input devices and are matched by name instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

enum Endpoint {
    Render(cpal::Device),
    Capture(cpal::Device),
}

impl Endpoint {
    fn device(&self) -> &cpal::Device {
        match self {
            Endpoint::Render(device) | Endpoint::Capture(device) => device,
        }
    }
}

fn device_names(devices: impl Iterator<Item = cpal::Device>) -> Vec<String> {
    devices.filter_map(|d| d.name().ok()).collect()
}

fn find_by_name(
    devices: Option<impl Iterator<Item = cpal::Device>>,
    name: &str,
) -> Option<cpal::Device> {
    devices?.find(|d| d.name().map(|n| n == name).unwrap_or(false))
}

fn resolve_endpoint(
    host: &cpal::Host,
    role: SourceRole,
    device: Option<&str>,
) -> Result<Endpoint, RecorderError> {
    let not_found = |name: &str| RecorderError::DeviceNotFound {
        role,
        name: name.to_string(),
    };
    match (role, device) {
        (SourceRole::Microphone, Some(name)) => find_by_name(host.input_devices().ok(), name)
            .map(Endpoint::Capture)
            .ok_or_else(|| not_found(name)),
        (SourceRole::Microphone, None) => host
            .default_input_device()
            .map(Endpoint::Capture)
            .ok_or_else(|| not_found("default")),
        (SourceRole::SystemLoopback, Some(name)) => find_by_name(host.output_devices().ok(), name)
            .map(Endpoint::Render)
            .or_else(|| find_by_name(host.input_devices().ok(), name).map(Endpoint::Capture))
            .ok_or_else(|| not_found(name)),
        (SourceRole::SystemLoopback, None) => host
            .default_output_device()
            .map(Endpoint::Render)
            .ok_or_else(|| not_found("default")),
    }
}

impl AudioBackend for CpalBackend {
    fn endpoints(&self) -> Result<EndpointInventory> {
        let host = cpal::default_host();
        let render = device_names(
            host.output_devices()
                .context("failed to enumerate render endpoints")?,
        );
        let capture = device_names(
            host.input_devices()
                .context("failed to enumerate capture endpoints")?,
        );
        Ok(EndpointInventory {
            render,
            capture,
            default_render: host.default_output_device().and_then(|d| d.name().ok()),
            default_capture: host.default_input_device().and_then(|d| d.name().ok()),
        })
    }

    fn open(
        &self,
        role: SourceRole,
        device: Option<&str>,
        sink_for: &mut SinkFactory<'_>,
    ) -> Result<Box<dyn ActiveCapture>, RecorderError> {
        let host = cpal::default_host();
        let endpoint = resolve_endpoint(&host, role, device)?;
        let name = endpoint
            .device()
            .name()
            .unwrap_or_else(|_| device.unwrap_or("default").to_string());
        let inactive = |detail: String| RecorderError::DeviceInactive {
            role,
            name: name.clone(),
            detail,
        };

        let supported = match &endpoint {
            Endpoint::Render(device) => device.default_output_config(),
            Endpoint::Capture(device) => device.default_input_config(),
        }
        .map_err(|err| inactive(err.to_string()))?;
        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.config();
        let format = StreamFormat::new(config.sample_rate.0, config.channels.max(1));

        log_debug(&format!(
            "opening {role} capture on '{name}': format={sample_format:?} {format}"
        ));

        let sink = sink_for(format);
        let device = endpoint.device();
        let stream = match sample_format {
            SampleFormat::F32 => build_stream::<f32, _>(device, &config, sink, |s| s),
            SampleFormat::I16 => {
                build_stream::<i16, _>(device, &config, sink, |s| s as f32 / 32_768.0)
            }
            SampleFormat::U16 => build_stream::<u16, _>(device, &config, sink, |s| {
                (s as f32 - 32_768.0) / 32_768.0
            }),
            other => return Err(inactive(format!("unsupported sample format: {other:?}"))),
        }
        .map_err(|err| inactive(err.to_string()))?;
        stream.play().map_err(|err| inactive(err.to_string()))?;

        tracing::info!(role = role.label(), device = %name, %format, "capture started");
        Ok(Box::new(CpalCapture {
            stream,
            format,
            name,
        }))
    }
}

/// Samples converted per step inside the callback.
const CALLBACK_CHUNK: usize = 4096;

/// Convert every supported sample type to f32 in the callback so the rest of
/// the pipeline stays format-agnostic. Conversion goes through a fixed stack
/// buffer, so the callback itself does not allocate.
fn build_stream<T, F>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut sink: CaptureSink,
    convert: F,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample,
    F: Fn(T) -> f32 + Send + 'static,
{
    let mut scratch = [0.0f32; CALLBACK_CHUNK];
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            for chunk in data.chunks(CALLBACK_CHUNK) {
                for (dst, src) in scratch.iter_mut().zip(chunk) {
                    *dst = convert(*src);
                }
                sink.deliver(&scratch[..chunk.len()]);
            }
        },
        |err| log_debug(&format!("audio_stream_error: {err}")),
        None,
    )
}

struct CpalCapture {
    stream: cpal::Stream,
    format: StreamFormat,
    name: String,
}

impl ActiveCapture for CpalCapture {
    fn format(&self) -> StreamFormat {
        self.format
    }

    fn stop(self: Box<Self>) {
        if let Err(err) = self.stream.pause() {
            log_debug(&format!("failed to pause capture on '{}': {err}", self.name));
        }
        drop(self.stream);
    }
}
