use super::defaults::{
    DEFAULT_CLEANUP_BACKOFF, FORBIDDEN_DEVICE_CHARS, MAX_CLEANUP_RETRIES, MAX_DEVICE_NAME_LEN,
    MAX_FRAMERATE, MAX_STOP_TIMEOUT_MS, MAX_TOOL_TIMEOUT_MS, MIN_FRAMERATE, MIN_TIMEOUT_MS,
    RECORDING_FILE_FORMAT, WRITE_PROBE_FILE,
};
use super::{AppConfig, RecorderSettings};
use crate::audio::{DeviceSelection, MixerConfig};
use crate::media::ScreenCaptureOptions;
use crate::session::SessionConfig;
use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

impl AppConfig {
    /// Parse CLI arguments and validate them right away.
    pub fn parse_args() -> Result<Self> {
        let mut config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    /// Check CLI values and normalize binary paths.
    pub fn validate(&mut self) -> Result<()> {
        if !(MIN_FRAMERATE..=MAX_FRAMERATE).contains(&self.framerate) {
            bail!(
                "--framerate must be between {MIN_FRAMERATE} and {MAX_FRAMERATE}, got {}",
                self.framerate
            );
        }
        if !(MIN_TIMEOUT_MS..=MAX_STOP_TIMEOUT_MS).contains(&self.stop_timeout_ms) {
            bail!(
                "--stop-timeout-ms must be between {MIN_TIMEOUT_MS} and {MAX_STOP_TIMEOUT_MS}, got {}",
                self.stop_timeout_ms
            );
        }
        if !(MIN_TIMEOUT_MS..=MAX_TOOL_TIMEOUT_MS).contains(&self.tool_timeout_ms) {
            bail!(
                "--tool-timeout-ms must be between {MIN_TIMEOUT_MS} and {MAX_TOOL_TIMEOUT_MS}, got {}",
                self.tool_timeout_ms
            );
        }
        if !(self.gate_threshold > 0.0 && self.gate_threshold < 1.0) {
            bail!(
                "--gate-threshold must be between 0.0 and 1.0 (exclusive), got {}",
                self.gate_threshold
            );
        }
        if !(1..=MAX_CLEANUP_RETRIES).contains(&self.cleanup_retries) {
            bail!(
                "--cleanup-retries must be between 1 and {MAX_CLEANUP_RETRIES}, got {}",
                self.cleanup_retries
            );
        }

        self.ffmpeg_cmd = sanitize_binary(&self.ffmpeg_cmd, "--ffmpeg-cmd", &["ffmpeg"])?;
        self.ffprobe_cmd = sanitize_binary(&self.ffprobe_cmd, "--ffprobe-cmd", &["ffprobe"])?;

        validate_device_name(self.mic_device.as_deref(), "--mic-device")?;
        validate_device_name(self.system_device.as_deref(), "--system-device")?;
        validate_device_name(self.video_input.as_deref(), "--video-input")?;

        if let Some(output) = &self.output {
            if output.is_dir() {
                bail!("--output '{}' is a directory", output.display());
            }
        }
        Ok(())
    }

    /// File logging is opt-in and `--no-logs` always wins.
    pub fn logging_enabled(&self) -> bool {
        self.logs && !self.no_logs
    }

    pub fn trace_level(&self) -> Level {
        if self.log_timings {
            Level::DEBUG
        } else {
            Level::INFO
        }
    }

    pub fn settings_path(&self) -> Option<PathBuf> {
        self.settings.clone().or_else(super::default_settings_path)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    pub fn screen_capture_options(&self) -> ScreenCaptureOptions {
        ScreenCaptureOptions {
            ffmpeg: self.ffmpeg_cmd.clone(),
            framerate: self.framerate,
            input: self.video_input.clone(),
            ..ScreenCaptureOptions::default()
        }
    }

    /// CLI flags win over stored settings; the result is what gets saved back.
    pub fn effective_settings(&self, stored: &RecorderSettings) -> RecorderSettings {
        RecorderSettings {
            base_path: self
                .output_dir
                .clone()
                .unwrap_or_else(|| stored.base_path.clone()),
            audio_source: self.audio_source.unwrap_or(stored.audio_source),
            system_audio_device: self
                .system_device
                .clone()
                .or_else(|| stored.system_audio_device.clone()),
            mic_audio_device: self
                .mic_device
                .clone()
                .or_else(|| stored.mic_audio_device.clone()),
        }
    }

    /// Snapshot the validated values for one session. Resolves the output
    /// file and makes sure its folder exists and is writable.
    pub fn session_config(&self, settings: &RecorderSettings) -> Result<SessionConfig> {
        let effective = self.effective_settings(settings);
        let output_path = match &self.output {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    ensure_writable_dir(parent)?;
                }
                path.clone()
            }
            None => {
                ensure_writable_dir(&effective.base_path)?;
                effective
                    .base_path
                    .join(recording_file_name(chrono::Local::now()))
            }
        };

        Ok(SessionConfig {
            output_path: Some(output_path),
            work_root: None,
            audio_source: effective.audio_source,
            devices: DeviceSelection {
                microphone: effective.mic_audio_device,
                system: effective.system_audio_device,
            },
            layout: self.layout,
            min_segment: None,
            stop_timeout: Duration::from_millis(self.stop_timeout_ms),
            mixer: MixerConfig {
                gate_threshold: self.gate_threshold,
                ..MixerConfig::default()
            },
            cleanup_attempts: self.cleanup_retries,
            cleanup_backoff: DEFAULT_CLEANUP_BACKOFF,
        })
    }
}

/// `Recording_<yyyyMMdd_HHmmss>.mp4` for the given local time.
pub fn recording_file_name<Tz>(now: chrono::DateTime<Tz>) -> String
where
    Tz: chrono::TimeZone,
    Tz::Offset: std::fmt::Display,
{
    now.format(RECORDING_FILE_FORMAT).to_string()
}

/// Create `dir` if needed and prove a file can be written inside it.
pub fn ensure_writable_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output folder '{}'", dir.display()))?;
    let probe = dir.join(WRITE_PROBE_FILE);
    fs::write(&probe, b"test")
        .with_context(|| format!("output folder '{}' is not writable", dir.display()))?;
    fs::remove_file(&probe)
        .with_context(|| format!("failed to remove '{}'", probe.display()))?;
    Ok(())
}

pub(super) fn validate_device_name(name: Option<&str>, flag: &str) -> Result<()> {
    let Some(name) = name else {
        return Ok(());
    };
    if name.trim().is_empty()
        || name.len() > MAX_DEVICE_NAME_LEN
        || name.chars().any(char::is_control)
        || name.chars().any(|ch| FORBIDDEN_DEVICE_CHARS.contains(&ch))
    {
        bail!(
            "{flag} must be 1-{MAX_DEVICE_NAME_LEN} characters with no control or shell metacharacters"
        );
    }
    Ok(())
}

/// Allow either a known binary name or an absolute path.
pub(super) fn sanitize_binary(value: &str, flag: &str, allowlist: &[&str]) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        bail!("{flag} cannot be empty");
    }
    if let Some(allowed) = allowlist
        .iter()
        .find(|candidate| candidate.eq_ignore_ascii_case(trimmed))
    {
        return Ok((*allowed).to_string());
    }

    let path = Path::new(trimmed);
    if path.is_absolute() || trimmed.contains(std::path::MAIN_SEPARATOR) {
        let canonical = path
            .canonicalize()
            .with_context(|| format!("failed to canonicalize {flag} '{trimmed}'"))?;
        let metadata = fs::metadata(&canonical)
            .with_context(|| format!("failed to inspect {flag} '{}'", canonical.display()))?;
        if !metadata.is_file() {
            bail!("{flag} '{}' is not a file", canonical.display());
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = metadata.permissions().mode();
            if mode & 0o111 == 0 {
                bail!(
                    "{flag} '{}' exists but is not executable (mode {:o})",
                    canonical.display(),
                    mode
                );
            }
        }
        return canonical
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("{flag} must be valid UTF-8"));
    }

    bail!("{flag} must be one of {allowlist:?} or an existing binary path");
}
