use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::process::{Command, Stdio};

/// Reports the playable duration of a media file in seconds.
pub trait DurationProbe: Send + Sync {
    fn duration_secs(&self, path: &Path) -> Result<f64>;
}

/// `ffprobe -show_streams -print_format json`, first stream with a duration.
#[derive(Debug, Clone)]
pub struct FfprobeDurationProbe {
    ffprobe: String,
}

impl FfprobeDurationProbe {
    pub fn new(ffprobe: impl Into<String>) -> Self {
        Self {
            ffprobe: ffprobe.into(),
        }
    }
}

impl Default for FfprobeDurationProbe {
    fn default() -> Self {
        Self::new("ffprobe")
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    // ffprobe prints durations as strings.
    duration: Option<String>,
}

pub(crate) fn parse_probe_duration(json: &str) -> Result<f64> {
    let output: ProbeOutput =
        serde_json::from_str(json).context("ffprobe returned malformed JSON")?;
    output
        .streams
        .iter()
        .filter_map(|stream| stream.duration.as_deref())
        .find_map(|raw| raw.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .ok_or_else(|| anyhow!("no stream reports a duration"))
}

impl DurationProbe for FfprobeDurationProbe {
    fn duration_secs(&self, path: &Path) -> Result<f64> {
        let output = Command::new(&self.ffprobe)
            .arg("-v")
            .arg("error")
            .arg("-i")
            .arg(path)
            .arg("-show_streams")
            .arg("-print_format")
            .arg("json")
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to run {}", self.ffprobe))?;
        if !output.status.success() {
            return Err(anyhow!(
                "{} failed on {}: {}",
                self.ffprobe,
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        parse_probe_duration(&String::from_utf8_lossy(&output.stdout))
            .with_context(|| format!("cannot read duration of {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn takes_first_stream_with_duration() {
        let json = r#"{"streams":[{"index":0,"codec_type":"data"},{"index":1,"duration":"12.480000"},{"duration":"3.0"}]}"#;
        let secs = parse_probe_duration(json).expect("duration");
        assert!((secs - 12.48).abs() < 1e-9);
    }

    #[test]
    fn missing_duration_is_an_error() {
        assert!(parse_probe_duration(r#"{"streams":[]}"#).is_err());
        assert!(parse_probe_duration("not json").is_err());
    }
}
