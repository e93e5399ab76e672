//! deskrec console entrypoint: one recording session driven from stdin.
//!
//! - Input thread: reads command lines (`p` pause/resume, `s` stop)
//! - Main thread: prints elapsed time once per second and owns the session
//! - Per segment: an ffmpeg screen grabber plus the audio mix worker

mod console;
mod devices;

use anyhow::{Context, Result};
use crossbeam_channel::bounded;
use deskrec::audio::CpalBackend;
use deskrec::config::{AppConfig, RecorderSettings};
use deskrec::media::{FfmpegScreenRecorder, FfmpegTool, FfprobeDurationProbe};
use deskrec::session::describe_sources;
use deskrec::{
    init_logging, init_tracing, log_debug, log_file_path, log_panic, SegmentSession, SessionDeps,
};
use std::panic;
use std::sync::{Arc, OnceLock};

const COMMAND_CHANNEL_CAPACITY: usize = 16;

static PANIC_HOOK_INSTALLED: OnceLock<()> = OnceLock::new();

fn install_panic_hook() {
    PANIC_HOOK_INSTALLED.get_or_init(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            log_panic(info);
            let location = info
                .location()
                .map(|loc| format!("{}:{}", loc.file(), loc.line()))
                .unwrap_or_else(|| "unknown".to_string());
            log_debug(&format!("panic at {location}"));
            previous(info);
        }));
    });
}

fn load_settings(config: &AppConfig) -> RecorderSettings {
    let Some(path) = config.settings_path() else {
        return RecorderSettings::default();
    };
    RecorderSettings::load(&path).unwrap_or_else(|err| {
        eprintln!("Ignoring unreadable settings: {err:#}");
        RecorderSettings::default()
    })
}

fn save_settings(config: &AppConfig, settings: &RecorderSettings) {
    if config.no_save_settings {
        return;
    }
    if let Some(path) = config.settings_path() {
        if let Err(err) = settings.save(&path) {
            log_debug(&format!("failed to save settings: {err:#}"));
        }
    }
}

fn main() -> Result<()> {
    let config = AppConfig::parse_args()?;
    init_logging(&config);
    init_tracing(&config);
    install_panic_hook();
    log_debug("=== deskrec started ===");
    log_debug(&format!("Log file: {:?}", log_file_path()));

    let backend = Arc::new(CpalBackend::new());
    if config.list_devices {
        return devices::list_devices(backend.as_ref());
    }

    let stored = load_settings(&config);
    let effective = config.effective_settings(&stored);
    let session_config = config
        .session_config(&stored)
        .context("cannot prepare the recording")?;
    save_settings(&config, &effective);

    let output = session_config
        .output_path
        .clone()
        .context("no output path resolved")?;
    let deps = SessionDeps {
        video: Arc::new(FfmpegScreenRecorder::new(config.screen_capture_options())),
        audio: backend,
        probe: Arc::new(FfprobeDurationProbe::new(config.ffprobe_cmd.clone())),
        tool: Arc::new(FfmpegTool::new(
            config.ffmpeg_cmd.clone(),
            config.tool_timeout(),
        )),
    };
    let mut session = SegmentSession::new(session_config, deps);
    session.start()?;
    println!(
        "Recording to {} with {}.",
        output.display(),
        describe_sources(effective.audio_source)
    );
    println!("Type p + Enter to pause/resume, s + Enter to stop.");

    let (command_tx, command_rx) = bounded(COMMAND_CHANNEL_CAPACITY);
    let _input_handle = console::spawn_command_thread(command_tx);
    let outcome = console::run(&mut session, &command_rx)?;

    println!(
        "Saved {} ({} segment{}, {:.1} MB{}).",
        outcome.output.display(),
        outcome.segments_merged,
        if outcome.segments_merged == 1 { "" } else { "s" },
        outcome.bytes as f64 / (1024.0 * 1024.0),
        if outcome.with_audio { ", with audio" } else { "" }
    );
    log_debug("=== deskrec finished ===");
    Ok(())
}
