use super::*;
use crate::test_support::{wav_samples, wav_secs, FakeProbe, FakeTool};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

fn write_video(dir: &Path, index: usize, secs: f64) -> PathBuf {
    let path = dir.join(format!("video_segment_{index}.mp4"));
    fs::write(&path, format!("dur={secs:.3}\n")).expect("write video");
    path
}

fn write_wav(path: &Path, rate: u32, channels: u16, secs: f64, value: i16) {
    let spec = hound::WavSpec {
        channels,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).expect("create wav");
    let frames = (secs * f64::from(rate)).round() as usize;
    for _ in 0..frames * usize::from(channels) {
        writer.write_sample(value).expect("sample");
    }
    writer.finalize().expect("finalize");
}

fn audio_at(dir: &Path, index: usize, secs: f64) -> PathBuf {
    let path = dir.join(format!("audio_segment_{index}.wav"));
    write_wav(&path, 48_000, 2, secs, 1_000);
    path
}

fn segment(index: usize, video: PathBuf, audio: Option<PathBuf>, offset_ms: u64) -> Segment {
    Segment {
        index,
        video_path: video,
        audio_path: audio,
        started_at: SystemTime::now(),
        created_by_resume: index > 0,
        audio_offset: Duration::from_millis(offset_ms),
        audio_significant: offset_ms > 0,
        recorded: Duration::from_secs(1),
    }
}

fn engine(tool: &Arc<FakeTool>, dir: &Path) -> MergeEngine {
    MergeEngine::new(tool.clone(), Arc::new(FakeProbe), dir)
}

#[test]
fn invalid_video_drops_its_paired_audio() {
    let dir = TempDir::new().expect("tempdir");
    let work = dir.path();
    let empty = work.join("video_segment_1.mp4");
    fs::write(&empty, b"").expect("empty");
    let segments = vec![
        segment(0, write_video(work, 0, 1.0), Some(audio_at(work, 0, 1.0)), 0),
        segment(1, empty, Some(audio_at(work, 1, 5.0)), 0),
        segment(2, work.join("video_segment_2.mp4"), Some(audio_at(work, 2, 5.0)), 0),
    ];
    let tool = FakeTool::new();
    let dest = work.join("out.mp4");

    let outcome = engine(&tool, work).merge(&segments, &dest).expect("merge");
    assert_eq!(outcome.segments_merged, 1);
    assert_eq!(outcome.segments_dropped, 2);
    assert_eq!(tool.concat_inputs(), vec![vec![work.join("video_segment_0.mp4")]]);
    let calls = tool.mux_calls();
    assert!((calls[0].audio_secs - 1.0).abs() < 1e-3, "audio {}s", calls[0].audio_secs);
}

#[test]
fn missing_middle_segment_keeps_the_rest_in_order() {
    let dir = TempDir::new().expect("tempdir");
    let work = dir.path();
    let last_audio = work.join("audio_segment_2.wav");
    write_wav(&last_audio, 48_000, 2, 2.0, -2_000);
    let segments = vec![
        segment(0, write_video(work, 0, 1.0), Some(audio_at(work, 0, 1.0)), 0),
        segment(1, work.join("video_segment_1.mp4"), Some(audio_at(work, 1, 4.0)), 0),
        segment(2, write_video(work, 2, 2.0), Some(last_audio), 0),
    ];
    let tool = FakeTool::new();

    let outcome = engine(&tool, work)
        .merge(&segments, &work.join("out.mp4"))
        .expect("merge");
    assert_eq!(outcome.segments_merged, 2);
    assert_eq!(outcome.segments_dropped, 1);
    assert_eq!(
        tool.concat_inputs(),
        vec![vec![
            work.join("video_segment_0.mp4"),
            work.join("video_segment_2.mp4")
        ]]
    );
    let calls = tool.mux_calls();
    assert!((calls[0].audio_secs - 3.0).abs() < 1e-3, "audio {}s", calls[0].audio_secs);

    let merged = wav_samples(&work.join(MERGED_AUDIO));
    let frame = |secs: f64| (secs * 48_000.0) as usize * 2;
    assert!((i32::from(merged[frame(0.5)]) - 1_000).abs() <= 1);
    assert!((i32::from(merged[frame(2.0)]) + 2_000).abs() <= 1);
}

#[test]
fn no_valid_segments_fails_validation() {
    let dir = TempDir::new().expect("tempdir");
    let segments = vec![segment(0, dir.path().join("missing.mp4"), None, 0)];
    let err = engine(&FakeTool::new(), dir.path())
        .merge(&segments, &dir.path().join("out.mp4"))
        .expect_err("nothing valid");
    assert!(matches!(
        err,
        RecorderError::MergeStageFailure { stage: MergeStage::Validating, .. }
    ));
    assert!(!dir.path().join("out.mp4").exists());
}

#[test]
fn video_only_merge_promotes_concatenated_video() {
    let dir = TempDir::new().expect("tempdir");
    let work = dir.path();
    let segments = vec![
        segment(0, write_video(work, 0, 1.5), None, 0),
        segment(1, write_video(work, 1, 2.5), None, 0),
    ];
    let tool = FakeTool::new();
    let dest = work.join("nested").join("Recording.mp4");

    let outcome = engine(&tool, work).merge(&segments, &dest).expect("merge");
    assert!(!outcome.with_audio);
    assert!(tool.mux_calls().is_empty());
    let secs = FakeProbe.duration_secs(&dest).expect("probe");
    assert!((secs - 4.0).abs() < 1e-9);
    assert_eq!(outcome.bytes, fs::metadata(&dest).expect("meta").len());
    assert!(!work.join(MERGED_VIDEO).exists());
}

#[test]
fn audio_plus_offset_is_padded_to_video_length() {
    let dir = TempDir::new().expect("tempdir");
    let work = dir.path();
    let segments = vec![segment(0, write_video(work, 0, 3.0), Some(audio_at(work, 0, 1.0)), 500)];
    let tool = FakeTool::new();

    let outcome = engine(&tool, work)
        .merge(&segments, &work.join("out.mp4"))
        .expect("merge");
    assert!(outcome.with_audio);
    assert!((outcome.audio_offset_secs - 0.5).abs() < 1e-9);
    let calls = tool.mux_calls();
    assert!((calls[0].offset - 0.5).abs() < 1e-9);
    assert!((calls[0].audio_secs - 2.5).abs() < 1e-3, "audio {}s", calls[0].audio_secs);
}

#[test]
fn audio_longer_than_video_is_left_alone() {
    let dir = TempDir::new().expect("tempdir");
    let work = dir.path();
    let segments = vec![segment(0, write_video(work, 0, 1.0), Some(audio_at(work, 0, 2.0)), 0)];
    let tool = FakeTool::new();
    engine(&tool, work)
        .merge(&segments, &work.join("out.mp4"))
        .expect("merge");
    assert!((tool.mux_calls()[0].audio_secs - 2.0).abs() < 1e-3);
}

#[test]
fn missing_segment_audio_holds_its_slot_with_silence() {
    let dir = TempDir::new().expect("tempdir");
    let work = dir.path();
    let segments = vec![
        segment(0, write_video(work, 0, 1.0), Some(audio_at(work, 0, 1.0)), 250),
        segment(1, write_video(work, 1, 2.0), Some(work.join("audio_segment_1.wav")), 0),
        segment(2, write_video(work, 2, 1.0), Some(audio_at(work, 2, 1.0)), 0),
    ];
    let tool = FakeTool::new();
    engine(&tool, work)
        .merge(&segments, &work.join("out.mp4"))
        .expect("merge");

    let merged = wav_samples(&work.join(MERGED_AUDIO));
    let frame = |secs: f64| (secs * 48_000.0) as usize * 2;
    // Re-quantizing through f32 may shave one step.
    assert!((i32::from(merged[frame(0.5)]) - 1_000).abs() <= 1);
    assert_eq!(merged[frame(2.0)], 0);
    assert!((i32::from(merged[frame(3.5)]) - 1_000).abs() <= 1);
    let calls = tool.mux_calls();
    assert!((calls[0].offset - 0.25).abs() < 1e-9);
    assert!((calls[0].audio_secs - 4.0).abs() < 1e-3);
}

#[test]
fn offset_comes_from_first_segment_with_audio() {
    let dir = TempDir::new().expect("tempdir");
    let work = dir.path();
    let segments = vec![
        segment(0, write_video(work, 0, 1.0), None, 0),
        segment(1, write_video(work, 1, 1.0), Some(audio_at(work, 1, 1.0)), 750),
    ];
    let tool = FakeTool::new();
    let outcome = engine(&tool, work)
        .merge(&segments, &work.join("out.mp4"))
        .expect("merge");
    assert!((outcome.audio_offset_secs - 0.75).abs() < 1e-9);
}

#[test]
fn foreign_wav_format_is_normalized() {
    let dir = TempDir::new().expect("tempdir");
    let work = dir.path();
    let audio = work.join("audio_segment_0.wav");
    write_wav(&audio, 44_100, 1, 1.0, 2_000);
    let segments = vec![segment(0, write_video(work, 0, 1.0), Some(audio), 0)];
    let tool = FakeTool::new();
    engine(&tool, work)
        .merge(&segments, &work.join("out.mp4"))
        .expect("merge");

    let merged = work.join(MERGED_AUDIO);
    let reader = hound::WavReader::open(&merged).expect("open");
    assert_eq!(reader.spec().sample_rate, 48_000);
    assert_eq!(reader.spec().channels, 2);
    assert!((wav_secs(&merged).expect("secs") - 1.0).abs() < 1e-3);
}

#[test]
fn mux_failure_names_the_stage_and_leaves_no_output() {
    let dir = TempDir::new().expect("tempdir");
    let work = dir.path();
    let segments = vec![segment(0, write_video(work, 0, 1.0), Some(audio_at(work, 0, 1.0)), 0)];
    let dest = work.join("out.mp4");
    let err = engine(&FakeTool::failing_mux(), work)
        .merge(&segments, &dest)
        .expect_err("mux fails");
    assert!(matches!(
        err,
        RecorderError::MergeStageFailure { stage: MergeStage::Muxing, .. }
    ));
    assert!(!dest.exists());
}

#[test]
fn staged_name_prefixes_destination() {
    assert_eq!(staged_name(Path::new("/x/Recording_1.mp4")), "staged_Recording_1.mp4");
}

#[test]
fn copy_fallback_lands_complete_file() {
    let dir = TempDir::new().expect("tempdir");
    let staged = dir.path().join("staged_out.mp4");
    fs::write(&staged, b"video bytes").expect("staged");
    let dest = dir.path().join("out.mp4");

    copy_into_place(&staged, &dest).expect("copy");
    assert_eq!(fs::read(&dest).expect("dest"), b"video bytes");
    assert!(!staged.exists());
    assert!(!partial_path(&dest).exists());
}

#[test]
fn failed_copy_leaves_nothing_under_the_final_name() {
    let dir = TempDir::new().expect("tempdir");
    let staged = dir.path().join("staged_out.mp4");
    fs::write(&staged, b"video bytes").expect("staged");
    // A directory in the way makes the final rename fail after the copy.
    let dest = dir.path().join("out.mp4");
    fs::create_dir(&dest).expect("blocker");
    fs::write(dest.join("keep"), b"x").expect("blocker content");

    assert!(copy_into_place(&staged, &dest).is_err());
    assert!(dest.is_dir());
    assert!(!partial_path(&dest).exists());
    assert!(staged.exists());

    let missing = dir.path().join("gone.mp4");
    assert!(promote(&missing, &dir.path().join("other.mp4")).is_err());
    assert!(!dir.path().join("other.mp4").exists());
}

#[test]
fn partial_path_sits_next_to_destination() {
    assert_eq!(
        partial_path(Path::new("/x/Recording_1.mp4")),
        PathBuf::from("/x/Recording_1.mp4.part")
    );
}
