use super::*;
use crate::error::RecordingError;
use crate::frame::{Frame, PixelFormat};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

fn create_test_frame(sequence: u64) -> Frame {
    Frame::new(
        sequence,
        SystemTime::now(),
        vec![(sequence % 251) as u8; 4 * 3],
        4,
        3,
        PixelFormat::Mono8,
    )
}

fn read_sequences(path: &std::path::Path) -> Vec<u64> {
    ClipReader::open(path)
        .unwrap()
        .read_all()
        .unwrap()
        .iter()
        .map(|f| f.sequence)
        .collect()
}

#[test]
fn test_preroll_flushed_oldest_first() {
    let temp_dir = TempDir::new().unwrap();
    let mut sink = RecordingSink::with_capacity(150).unwrap();

    for sequence in 0..200 {
        assert!(sink.push_frame(&create_test_frame(sequence)).is_none());
    }

    let request = RecordingRequest::new(temp_dir.path().join("preroll.clip"), Codec::Clip);
    let started = sink
        .start(&request, (4, 3), PixelFormat::Mono8, Some(30.0))
        .unwrap();
    assert_eq!(started.preroll_frames, 150);

    for sequence in 200..205 {
        sink.push_frame(&create_test_frame(sequence));
    }

    let summary = sink.stop(StopReason::Operator).unwrap();
    assert_eq!(summary.preroll_frames, 150);
    assert_eq!(summary.total_frames, 155);
    assert_eq!(summary.stop_reason, StopReason::Operator);

    let sequences = read_sequences(&summary.path);
    assert_eq!(sequences, (50..205).collect::<Vec<_>>());
}

#[test]
fn test_stop_clears_preroll_and_writes_sidecar() {
    let temp_dir = TempDir::new().unwrap();
    let mut sink = RecordingSink::new(1, 10.0).unwrap();
    assert_eq!(sink.preroll_capacity(), 10);

    for sequence in 0..4 {
        sink.push_frame(&create_test_frame(sequence));
    }

    let request = RecordingRequest::new(temp_dir.path().join("nested/dir/run.clip"), Codec::Clip);
    sink.start(&request, (4, 3), PixelFormat::Mono8, None).unwrap();
    assert!(sink.is_active());
    assert_eq!(sink.active_path(), Some(request.output_path.as_path()));

    let summary = sink.stop(StopReason::Operator).unwrap();
    assert!(!sink.is_active());
    assert_eq!(sink.preroll_len(), 0);

    let sidecar = std::fs::read_to_string(sidecar_path(&summary.path)).unwrap();
    let parsed: RecordingSummary = serde_json::from_str(&sidecar).unwrap();
    assert_eq!(parsed.id, summary.id);
    assert_eq!(parsed.total_frames, 4);
    assert_eq!(parsed.fps, 30.0);
}

#[test]
fn test_start_twice_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let mut sink = RecordingSink::with_capacity(5).unwrap();
    let request = RecordingRequest::new(temp_dir.path().join("a.clip"), Codec::Clip);

    sink.start(&request, (4, 3), PixelFormat::Mono8, Some(30.0)).unwrap();
    assert!(matches!(
        sink.start(&request, (4, 3), PixelFormat::Mono8, Some(30.0)),
        Err(RecordingError::AlreadyActive)
    ));
    sink.stop(StopReason::Operator).unwrap();
    assert!(matches!(
        sink.stop(StopReason::Operator),
        Err(RecordingError::NotActive)
    ));
}

#[test]
fn test_failed_open_leaves_recording_inactive() {
    let temp_dir = TempDir::new().unwrap();
    // A regular file where the output directory should be
    let blocker = temp_dir.path().join("blocker");
    std::fs::write(&blocker, b"x").unwrap();

    let mut sink = RecordingSink::with_capacity(5).unwrap();
    sink.push_frame(&create_test_frame(0));

    let request = RecordingRequest::new(blocker.join("out.clip"), Codec::Clip);
    let result = sink.start(&request, (4, 3), PixelFormat::Mono8, Some(30.0));
    assert!(matches!(result, Err(RecordingError::DirectoryCreation { .. })));
    assert!(!sink.is_active());
    assert_eq!(sink.preroll_len(), 1);
}

#[test]
fn test_preroll_write_failure_discards_partial_file() {
    let temp_dir = TempDir::new().unwrap();
    let mut sink = RecordingSink::with_capacity(5).unwrap();
    sink.push_frame(&create_test_frame(0));

    // Writer sized differently from the buffered frames
    let path = temp_dir.path().join("mismatch.clip");
    let request = RecordingRequest::new(&path, Codec::Clip);
    let result = sink.start(&request, (8, 8), PixelFormat::Mono8, Some(30.0));

    assert!(matches!(result, Err(RecordingError::Write { .. })));
    assert!(!sink.is_active());
    assert!(!path.exists());
}

#[test]
fn test_max_duration_closes_session() {
    let temp_dir = TempDir::new().unwrap();
    let mut sink = RecordingSink::with_capacity(5).unwrap();

    let mut request = RecordingRequest::new(temp_dir.path().join("short.clip"), Codec::Clip);
    request.max_duration = Some(Duration::from_millis(20));
    sink.start(&request, (4, 3), PixelFormat::Mono8, Some(30.0)).unwrap();

    assert!(sink.push_frame(&create_test_frame(1)).is_none());
    std::thread::sleep(Duration::from_millis(40));

    let summary = sink.push_frame(&create_test_frame(2)).unwrap();
    assert_eq!(summary.stop_reason, StopReason::MaxDuration);
    assert_eq!(summary.total_frames, 1);
    assert!(!sink.is_active());
}

#[test]
fn test_request_builders() {
    let request = RecordingRequest::in_directory("/tmp/recordings", "inspect", Codec::H264)
        .with_fps(Some(12.5))
        .with_quality(90)
        .with_max_duration_seconds(0);

    assert!(request.output_path.starts_with("/tmp/recordings"));
    assert_eq!(
        request.output_path.extension().and_then(|e| e.to_str()),
        Some("mp4")
    );
    assert_eq!(request.fps, Some(12.5));
    assert!(request.max_duration.is_none());
    assert_eq!(
        RecordingRequest::new("a.clip", Codec::Clip)
            .with_max_duration_seconds(30)
            .max_duration,
        Some(Duration::from_secs(30))
    );
}
