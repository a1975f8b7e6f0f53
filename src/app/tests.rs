use super::*;
use crate::config::InspectorConfig;
use crate::events::{InspectionEvent, OperatorCommand};
use crate::source::{CaptureState, SourceKind};
use std::time::Duration;
use tempfile::TempDir;

fn create_test_config(temp_dir: &TempDir) -> InspectorConfig {
    let mut config = InspectorConfig::default();
    config.source.kind = SourceKind::File;
    config.camera.device = "stub://cam?width=8&height=6&fps=200".to_string();
    config.camera.resolution = (8, 6);
    config.file.path = "stub://reel?frames=100000&fps=500&width=4&height=4".to_string();
    config.recording.path = temp_dir.path().join("recordings").display().to_string();
    config.recording.preroll_seconds = 1;
    config.training.path = temp_dir.path().join("training").display().to_string();
    config.system.status_interval_seconds = 1;
    config
}

async fn wait_for_frames(app: &InspectorApp, count: u64) -> bool {
    for _ in 0..400 {
        if app.display().is_some_and(|d| d.state().frames_displayed >= count) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

fn state(app: &InspectorApp) -> Option<CaptureState> {
    app.controller().map(|c| c.state())
}

#[tokio::test]
async fn test_app_creation() {
    let temp_dir = TempDir::new().unwrap();
    let mut app = InspectorApp::new(create_test_config(&temp_dir)).await.unwrap();

    assert_eq!(app.component_state("controller"), None);

    app.initialize().await.unwrap();
    assert_eq!(
        app.component_state("controller"),
        Some(ComponentState::Stopped)
    );
    assert_eq!(app.component_state("console"), None);
    assert_eq!(state(&app), Some(CaptureState::Disconnected));
}

#[tokio::test]
async fn test_status_line_reports_components_not_running() {
    let temp_dir = TempDir::new().unwrap();
    let mut app = InspectorApp::new(create_test_config(&temp_dir)).await.unwrap();
    app.initialize().await.unwrap();

    let line = app.status_line();
    assert!(line.starts_with("file Disconnected"));
    assert!(line.ends_with(" | controller stopped"));

    app.start(StartOptions::default()).await.unwrap();
    let line = app.status_line();
    assert!(line.starts_with("file Connected"));
    assert!(!line.contains("stopped"));

    app.shutdown(&ShutdownReason::UserRequest).await.unwrap();
    assert_eq!(
        app.status_line(),
        "controller shut down | controller stopped, display stopped, inference stopped"
    );
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = create_test_config(&temp_dir);
    config.inference.confidence_threshold = 1.5;
    assert!(InspectorApp::new(config).await.is_err());

    let mut config = create_test_config(&temp_dir);
    config.inference.enabled = true;
    config.inference.model_path = None;
    assert!(InspectorApp::new(config).await.is_err());
}

#[tokio::test]
async fn test_start_options() {
    let temp_dir = TempDir::new().unwrap();
    let mut app = InspectorApp::new(create_test_config(&temp_dir)).await.unwrap();
    app.initialize().await.unwrap();

    app.start(StartOptions {
        path_override: None,
        start_capture: true,
        record: true,
    })
    .await
    .unwrap();

    assert_eq!(state(&app), Some(CaptureState::Capturing));
    assert!(app.controller().is_some_and(|c| c.is_recording()));
    assert_eq!(
        app.component_state("controller"),
        Some(ComponentState::Running)
    );

    let exit_code = app.shutdown(&ShutdownReason::UserRequest).await.unwrap();
    assert_eq!(exit_code, 0);
    assert_eq!(
        app.component_state("controller"),
        Some(ComponentState::Stopped)
    );
    assert_eq!(
        app.component_state("display"),
        Some(ComponentState::Stopped)
    );

    let clips = crate::recording::find_clips(&temp_dir.path().join("recordings")).unwrap();
    assert_eq!(clips.len(), 1);
}

#[tokio::test]
async fn test_start_with_unavailable_source_keeps_running() {
    let temp_dir = TempDir::new().unwrap();
    let mut app = InspectorApp::new(create_test_config(&temp_dir)).await.unwrap();
    app.initialize().await.unwrap();

    app.start(StartOptions {
        path_override: Some("/nonexistent/reel.clip".to_string()),
        start_capture: true,
        record: false,
    })
    .await
    .unwrap();
    assert_eq!(state(&app), Some(CaptureState::Disconnected));

    // The operator can still switch to a working source
    assert!(app
        .apply_command(OperatorCommand::Switch(SourceKind::HardwareCamera))
        .await
        .is_none());
    assert_eq!(state(&app), Some(CaptureState::Connected));
    app.shutdown(&ShutdownReason::UserRequest).await.unwrap();
}

#[tokio::test]
async fn test_operator_commands() {
    let temp_dir = TempDir::new().unwrap();
    let mut app = InspectorApp::new(create_test_config(&temp_dir)).await.unwrap();
    app.initialize().await.unwrap();
    app.start(StartOptions::default()).await.unwrap();
    assert_eq!(state(&app), Some(CaptureState::Connected));

    assert!(app.apply_command(OperatorCommand::StartCapture).await.is_none());
    assert_eq!(state(&app), Some(CaptureState::Capturing));
    assert!(wait_for_frames(&app, 3).await);

    app.apply_command(OperatorCommand::Snapshot).await;
    let snapshots = std::fs::read_dir(temp_dir.path().join("training").join("None"))
        .unwrap()
        .count();
    assert_eq!(snapshots, 1);

    app.apply_command(OperatorCommand::ToggleRecording).await;
    assert!(app.controller().is_some_and(|c| c.is_recording()));
    app.apply_command(OperatorCommand::ToggleRecording).await;
    assert!(app.controller().is_some_and(|c| !c.is_recording()));

    let before = app.controller().map(|c| c.threshold()).unwrap_or_default();
    app.apply_command(OperatorCommand::AdjustThreshold(-THRESHOLD_STEP))
        .await;
    let after = app.controller().map(|c| c.threshold()).unwrap_or_default();
    assert!((before - after - THRESHOLD_STEP).abs() < 1e-6);

    app.apply_command(OperatorCommand::StopCapture).await;
    assert_eq!(state(&app), Some(CaptureState::Connected));

    app.apply_command(OperatorCommand::Switch(SourceKind::NetworkCamera))
        .await;
    assert_eq!(app.controller().map(|c| c.kind()), Some(SourceKind::NetworkCamera));

    assert_eq!(
        app.apply_command(OperatorCommand::Quit).await,
        Some(ShutdownReason::UserRequest)
    );
    app.shutdown(&ShutdownReason::UserRequest).await.unwrap();
}

#[tokio::test]
async fn test_defect_event_triggers_recording() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = create_test_config(&temp_dir);
    config.recording.record_on_defect = true;
    let mut app = InspectorApp::new(config).await.unwrap();
    app.initialize().await.unwrap();
    app.start(StartOptions {
        start_capture: true,
        ..StartOptions::default()
    })
    .await
    .unwrap();

    let reason = app
        .handle_event(InspectionEvent::DefectStateChanged { active: true })
        .await;
    assert!(reason.is_none());
    assert!(app.controller().is_some_and(|c| c.is_recording()));

    let reason = app
        .handle_event(InspectionEvent::ShutdownRequested {
            timestamp: std::time::SystemTime::now(),
            reason: "test".to_string(),
        })
        .await;
    assert_eq!(reason, Some(ShutdownReason::UserRequest));
    app.shutdown(&ShutdownReason::UserRequest).await.unwrap();
}

#[tokio::test]
async fn test_run_until_quit_command() {
    let temp_dir = TempDir::new().unwrap();
    let mut app = InspectorApp::new(create_test_config(&temp_dir)).await.unwrap();
    app.initialize().await.unwrap();
    app.start(StartOptions {
        start_capture: true,
        ..StartOptions::default()
    })
    .await
    .unwrap();

    let events = app.events().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        events.publish(InspectionEvent::OperatorCommand {
            command: OperatorCommand::StopCapture,
        });
        events.publish(InspectionEvent::OperatorCommand {
            command: OperatorCommand::Quit,
        });
    });

    let exit_code = tokio::time::timeout(Duration::from_secs(10), app.run())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exit_code, 0);
    assert!(app.controller().is_none());

    // A second run has no shutdown channel left
    assert!(app.run().await.is_err());
}
