use super::*;
use crate::audio::{AudioSourceKind, MixerConfig, SourceRole};
use crate::error::MergeStage;
use crate::media::DurationProbe;
use crate::test_support::{FakeAudioBackend, FakeProbe, FakeTool, FakeVideo};
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    dir: TempDir,
    video: Arc<FakeVideo>,
    audio: Arc<FakeAudioBackend>,
    tool: Arc<FakeTool>,
}

impl Harness {
    fn new() -> Self {
        Self::with_tool(FakeTool::new())
    }

    fn with_tool(tool: Arc<FakeTool>) -> Self {
        Self {
            dir: TempDir::new().expect("tempdir"),
            video: FakeVideo::fixed(2.0),
            audio: FakeAudioBackend::new(),
            tool,
        }
    }

    fn output(&self) -> PathBuf {
        self.dir.path().join("Recording_20240101_120000.mp4")
    }

    fn config(&self, source: AudioSourceKind) -> SessionConfig {
        SessionConfig {
            output_path: Some(self.output()),
            audio_source: source,
            min_segment: Some(Duration::ZERO),
            stop_timeout: Duration::from_millis(200),
            cleanup_backoff: Duration::from_millis(5),
            mixer: MixerConfig {
                poll_interval: Duration::from_millis(1),
                idle_backoff: Duration::from_millis(1),
                ..MixerConfig::default()
            },
            ..SessionConfig::default()
        }
    }

    fn session(&self, config: SessionConfig) -> SegmentSession {
        SegmentSession::new(
            config,
            SessionDeps {
                video: self.video.clone(),
                audio: self.audio.clone(),
                probe: Arc::new(FakeProbe),
                tool: self.tool.clone(),
            },
        )
    }

    fn temp_dirs(&self) -> Vec<PathBuf> {
        fs::read_dir(self.dir.path())
            .expect("read dir")
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .map(|n| n.to_string_lossy().starts_with("temp_segments_"))
                    .unwrap_or(false)
            })
            .collect()
    }
}

#[test]
fn start_without_output_path_is_rejected() {
    let harness = Harness::new();
    let mut config = harness.config(AudioSourceKind::None);
    config.output_path = None;
    let mut session = harness.session(config);
    assert!(matches!(
        session.start(),
        Err(RecorderError::OutputPathMissing)
    ));
    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(harness.video.begins(), 0);
}

#[test]
fn start_fails_fast_when_tool_is_missing() {
    let harness = Harness::with_tool(FakeTool::unavailable());
    let mut session = harness.session(harness.config(AudioSourceKind::None));
    assert!(matches!(
        session.start(),
        Err(RecorderError::ToolUnavailable(_))
    ));
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(harness.temp_dirs().is_empty());
}

#[test]
fn transitions_outside_the_state_machine_are_rejected() {
    let harness = Harness::new();
    let mut session = harness.session(harness.config(AudioSourceKind::None));

    assert!(matches!(
        session.pause(),
        Err(RecorderError::InvalidState { action: "pause", state: "stopped" })
    ));
    assert!(matches!(session.resume(), Err(RecorderError::InvalidState { .. })));
    assert!(matches!(session.stop(), Err(RecorderError::InvalidState { .. })));

    session.start().expect("start");
    assert!(matches!(
        session.start(),
        Err(RecorderError::InvalidState { action: "start", state: "recording" })
    ));
    assert!(matches!(session.resume(), Err(RecorderError::InvalidState { .. })));

    session.pause().expect("pause");
    assert!(matches!(
        session.pause(),
        Err(RecorderError::InvalidState { action: "pause", state: "paused" })
    ));
    session.stop().expect("stop");
    assert_eq!(session.state(), SessionState::Stopped);
}

#[test]
fn segments_are_numbered_and_flagged_by_origin() {
    let harness = Harness::new();
    let mut session = harness.session(harness.config(AudioSourceKind::None));
    session.start().expect("start");
    let temp = session.temp_dir().expect("temp dir").to_path_buf();
    assert!(temp.starts_with(harness.dir.path()));

    session.pause().expect("pause");
    session.resume().expect("resume");
    session.pause().expect("pause");

    let segments = session.segments();
    assert_eq!(segments.len(), 2);
    assert_eq!(segments[0].index, 0);
    assert!(!segments[0].created_by_resume);
    assert_eq!(segments[1].index, 1);
    assert!(segments[1].created_by_resume);
    assert_eq!(segments[1].video_path, temp.join("video_segment_1.mp4"));
    assert!(segments.iter().all(|s| s.audio_path.is_none()));
    assert_eq!(session.segment_counter(), 2);
}

#[test]
fn video_only_session_concatenates_every_segment() {
    let harness = Harness::new();
    let mut session = harness.session(harness.config(AudioSourceKind::None));
    session.start().expect("start");
    session.pause().expect("pause");
    session.resume().expect("resume");
    session.pause().expect("pause");
    session.resume().expect("resume");
    let temp = session.temp_dir().expect("temp dir").to_path_buf();

    let outcome = session.stop().expect("stop");
    assert_eq!(outcome.output, harness.output());
    assert_eq!(outcome.segments_merged, 3);
    assert!(!outcome.with_audio);
    let secs = FakeProbe.duration_secs(&harness.output()).expect("probe");
    assert!((secs - 6.0).abs() < 1e-6, "merged {secs}s");
    assert!(harness.tool.mux_calls().is_empty());
    assert_eq!(harness.tool.concat_inputs()[0].len(), 3);

    assert!(!temp.exists());
    assert!(session.segments().is_empty());
    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(session.elapsed(), Duration::ZERO);
}

#[test]
fn short_segment_is_discarded_and_its_index_reused() {
    let harness = Harness::new();
    let mut config = harness.config(AudioSourceKind::None);
    config.min_segment = Some(Duration::from_secs(60));
    let mut session = harness.session(config);

    session.start().expect("start");
    let temp = session.temp_dir().expect("temp dir").to_path_buf();
    session.pause().expect("pause");
    assert!(session.segments().is_empty());
    assert_eq!(session.segment_counter(), 0);
    assert!(!temp.join("video_segment_0.mp4").exists());

    session.resume().expect("resume");
    assert_eq!(session.segment_counter(), 1);

    let err = session.stop().expect_err("nothing to merge");
    assert!(matches!(
        err,
        RecorderError::MergeStageFailure { stage: MergeStage::Validating, .. }
    ));
    assert!(!temp.exists());
    assert_eq!(session.state(), SessionState::Stopped);
}

#[test]
fn empty_video_segment_is_dropped_with_its_audio() {
    let harness = Harness::new();
    harness.video.leave_empty(1);
    let mut session = harness.session(harness.config(AudioSourceKind::Microphone));

    session.start().expect("start");
    session.pause().expect("pause");
    session.resume().expect("resume");
    let temp = session.temp_dir().expect("temp dir").to_path_buf();
    session.pause().expect("pause");

    assert_eq!(session.segments().len(), 1);
    assert!(!temp.join("video_segment_1.mp4").exists());
    assert!(!temp.join("audio_segment_1.wav").exists());

    session.resume().expect("resume");
    let outcome = session.stop().expect("stop");
    assert_eq!(outcome.segments_merged, 2);
    assert!(outcome.with_audio);
}

#[test]
fn silent_audio_is_padded_to_the_video_length() {
    let harness = Harness::new();
    let mut session = harness.session(harness.config(AudioSourceKind::Microphone));

    session.start().expect("start");
    session.pause().expect("pause");
    let first = session.segments()[0].clone();
    assert!(!first.audio_significant);
    assert_eq!(first.audio_offset, Duration::ZERO);
    let secs = crate::test_support::wav_secs(first.audio_path().expect("audio")).expect("wav");
    assert!((secs - 2.0).abs() < 1e-3, "segment audio {secs}s");

    session.resume().expect("resume");
    let outcome = session.stop().expect("stop");
    assert!(outcome.with_audio);

    let calls = harness.tool.mux_calls();
    assert_eq!(calls.len(), 1);
    assert!((calls[0].audio_secs - 4.0).abs() < 1e-3, "merged {}s", calls[0].audio_secs);
    assert_eq!(calls[0].offset, 0.0);
    assert!(harness.audio.stopped() >= 2);
}

#[test]
fn device_failure_on_resume_leaves_session_paused() {
    let harness = Harness::new();
    let mut session = harness.session(harness.config(AudioSourceKind::Microphone));
    session.start().expect("start");
    session.pause().expect("pause");

    harness.audio.remove_device(SourceRole::Microphone);
    let err = session.resume().expect_err("device gone");
    assert!(err.is_device_error());
    assert_eq!(session.state(), SessionState::Paused);
    assert_eq!(session.segment_counter(), 1);

    let outcome = session.stop().expect("stop");
    assert_eq!(outcome.segments_merged, 1);
}

#[test]
fn video_failure_on_start_cleans_up() {
    let harness = Harness::new();
    harness.video.fail_begin(0);
    let mut session = harness.session(harness.config(AudioSourceKind::Microphone));
    assert!(session.start().is_err());
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(harness.temp_dirs().is_empty());
    assert!(harness.audio.stopped() >= 1);
}

#[test]
fn merge_failure_still_removes_temp_dir() {
    let harness = Harness::with_tool(FakeTool::failing_mux());
    let mut session = harness.session(harness.config(AudioSourceKind::Microphone));
    session.start().expect("start");
    let temp = session.temp_dir().expect("temp dir").to_path_buf();

    let err = session.stop().expect_err("mux fails");
    assert!(matches!(
        err,
        RecorderError::MergeStageFailure { stage: MergeStage::Muxing, .. }
    ));
    assert!(!temp.exists());
    assert!(!harness.output().exists());
}

#[test]
fn muxed_layout_hands_the_device_to_the_video_producer() {
    let harness = Harness::new();
    let mut config = harness.config(AudioSourceKind::SystemLoopback);
    config.layout = SegmentLayout::Muxed;
    config.devices.system = Some("Speakers".to_string());
    let mut session = harness.session(config);

    session.start().expect("start");
    session.pause().expect("pause");
    assert!(session.segments()[0].audio_path.is_none());
    assert_eq!(harness.audio.opened(), 0);
    let muxed = harness.video.muxed_inputs();
    assert_eq!(
        muxed[0],
        Some(MuxedAudioInput {
            role: SourceRole::SystemLoopback,
            device: Some("Speakers".to_string()),
        })
    );
    let outcome = session.stop().expect("stop");
    assert!(!outcome.with_audio);
}

#[test]
fn producer_startup_counts_toward_segment_length() {
    let mut harness = Harness::new();
    harness.video = FakeVideo::fixed_with_startup(2.0, Duration::from_millis(300));
    let mut config = harness.config(AudioSourceKind::None);
    config.min_segment = None;
    assert_eq!(config.min_segment(), MIN_SPLIT_SEGMENT);
    let mut session = harness.session(config);

    session.start().expect("start");
    thread::sleep(Duration::from_millis(250));
    session.pause().expect("pause");

    assert_eq!(session.segments().len(), 1);
    assert_eq!(session.segment_counter(), 1);
    assert!(session.segments()[0].recorded >= Duration::from_millis(550));
    assert!(session.elapsed() >= Duration::from_millis(550));
    session.stop().expect("stop");
}

#[test]
fn elapsed_excludes_paused_time() {
    let harness = Harness::new();
    let mut session = harness.session(harness.config(AudioSourceKind::None));
    session.start().expect("start");
    thread::sleep(Duration::from_millis(30));
    session.pause().expect("pause");
    let banked = session.elapsed();
    assert!(banked >= Duration::from_millis(30));

    thread::sleep(Duration::from_millis(50));
    assert_eq!(session.elapsed(), banked);

    session.resume().expect("resume");
    thread::sleep(Duration::from_millis(10));
    assert!(session.elapsed() >= banked + Duration::from_millis(10));
    session.stop().expect("stop");
}

#[test]
fn layout_minimums() {
    assert_eq!(SegmentLayout::SplitTracks.min_segment(), Duration::from_millis(500));
    assert_eq!(SegmentLayout::Muxed.min_segment(), Duration::from_secs(2));
    let config = SessionConfig::default();
    assert_eq!(config.min_segment(), MIN_SPLIT_SEGMENT);
}

#[test]
fn cleanup_of_missing_dir_succeeds() {
    let dir = TempDir::new().expect("tempdir");
    let gone = dir.path().join("never_created");
    remove_dir_with_retries(&gone, 3, Duration::from_millis(1)).expect("nothing to remove");
}

#[test]
fn elapsed_formats_as_clock() {
    assert_eq!(format_elapsed(Duration::from_secs(0)), "00:00:00");
    assert_eq!(format_elapsed(Duration::from_secs(3_725)), "01:02:05");
    assert_eq!(describe_sources(AudioSourceKind::Both), "microphone + system audio");
    assert_eq!(describe_sources(AudioSourceKind::None), "no audio");
}
