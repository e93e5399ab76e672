//! Choices remembered between runs.

use crate::audio::AudioSourceKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderSettings {
    /// Folder recordings are saved into.
    pub base_path: PathBuf,
    pub audio_source: AudioSourceKind,
    pub system_audio_device: Option<String>,
    pub mic_audio_device: Option<String>,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            audio_source: AudioSourceKind::None,
            system_audio_device: None,
            mic_audio_device: None,
        }
    }
}

fn default_base_path() -> PathBuf {
    dirs::desktop_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// `<config_dir>/deskrec/settings.json`.
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("deskrec").join("settings.json"))
}

impl RecorderSettings {
    /// Read settings; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no settings file; using defaults");
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings '{}'", path.display()))?;
        let settings = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse settings '{}'", path.display()))?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create '{}'", parent.display()))?;
        }
        let contents =
            serde_json::to_string_pretty(self).context("failed to serialize settings")?;
        fs::write(path, contents)
            .with_context(|| format!("failed to write settings '{}'", path.display()))?;
        tracing::info!(path = %path.display(), "settings saved");
        Ok(())
    }
}
