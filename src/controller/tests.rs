use super::core::FrameHandler;
use super::*;
use crate::config::InspectorConfig;
use crate::error::{CaptureError, InferenceError};
use crate::events::{EventBus, InspectionEvent};
use crate::frame::{Frame, PixelFormat};
use crate::inference::{Classification, Classifier, InferenceAdapter, NullClassifier};
use crate::source::{
    BackendOpener, BackendRead, CameraTuning, CaptureBackend, CaptureState, DefaultBackendOpener, FrameSink,
    SourceConfig, SourceKind,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tokio::sync::broadcast::{self, error::TryRecvError};

/// Wraps the default opener and logs opens and closes in order
struct InstrumentedOpener {
    log: Arc<Mutex<Vec<String>>>,
}

struct InstrumentedBackend {
    inner: Box<dyn CaptureBackend>,
    kind: SourceKind,
    log: Arc<Mutex<Vec<String>>>,
}

impl BackendOpener for InstrumentedOpener {
    fn open(
        &self,
        config: &SourceConfig,
        path_override: Option<&str>,
    ) -> Result<Box<dyn CaptureBackend>, CaptureError> {
        let inner = DefaultBackendOpener.open(config, path_override)?;
        self.log.lock().push(format!("open {}", config.kind().as_str()));
        Ok(Box::new(InstrumentedBackend {
            inner,
            kind: config.kind(),
            log: Arc::clone(&self.log),
        }))
    }
}

impl CaptureBackend for InstrumentedBackend {
    fn describe(&self) -> String {
        self.inner.describe()
    }

    fn read_frame(&mut self) -> Result<BackendRead, CaptureError> {
        self.inner.read_frame()
    }

    fn seek(&mut self, position: u64) -> Result<(), CaptureError> {
        self.inner.seek(position)
    }

    fn position(&self) -> Option<u64> {
        self.inner.position()
    }

    fn frame_count(&self) -> Option<u64> {
        self.inner.frame_count()
    }

    fn fps(&self) -> Option<f64> {
        self.inner.fps()
    }

    fn frame_size(&self) -> Option<(u32, u32)> {
        self.inner.frame_size()
    }

    fn pixel_format(&self) -> PixelFormat {
        self.inner.pixel_format()
    }

    fn apply_tuning(&mut self, tuning: &CameraTuning) -> Result<(), CaptureError> {
        self.inner.apply_tuning(tuning)
    }
}

impl Drop for InstrumentedBackend {
    fn drop(&mut self) {
        self.log.lock().push(format!("close {}", self.kind.as_str()));
    }
}

/// Always answers with the same classification
struct FixedClassifier {
    label: &'static str,
    confidence: f32,
}

impl Classifier for FixedClassifier {
    fn name(&self) -> &str {
        "fixed"
    }

    fn predict(&self, _frame: &Frame) -> Result<Classification, InferenceError> {
        Ok(Classification::new(self.label, self.confidence))
    }
}

/// Runs display jobs inline and records the sequence shown by each
#[derive(Default)]
struct InlineMarshal {
    state: Mutex<DisplayState>,
    shown: Mutex<Vec<u64>>,
}

impl DisplayMarshal for InlineMarshal {
    fn post(&self, job: DisplayJob) -> bool {
        let mut state = self.state.lock();
        job(&mut state);
        if let Some(frame) = &state.current_frame {
            self.shown.lock().push(frame.sequence);
        }
        true
    }
}

pub(super) struct Harness {
    pub(super) controller: SourceController,
    display: Arc<DisplayContext>,
    inference: Arc<InferenceAdapter>,
    pub(super) events: EventBus,
    temp_dir: TempDir,
}

fn test_config(temp_dir: &TempDir) -> InspectorConfig {
    let mut config = InspectorConfig::default();
    config.source.kind = SourceKind::HardwareCamera;
    config.camera.device = "stub://cam?width=8&height=6&fps=200".to_string();
    config.camera.resolution = (8, 6);
    config.file.path = "stub://reel?frames=20&fps=500&width=4&height=4".to_string();
    config.recording.path = temp_dir.path().join("recordings").display().to_string();
    config.recording.preroll_seconds = 1;
    config.training.path = temp_dir.path().join("training").display().to_string();
    config
}

fn harness_with(
    classifier: Arc<dyn Classifier>,
    opener: Arc<dyn BackendOpener>,
    configure: impl FnOnce(&mut InspectorConfig),
) -> Harness {
    let temp_dir = TempDir::new().unwrap();
    let mut config = test_config(&temp_dir);
    configure(&mut config);

    let events = EventBus::new(512);
    let display = Arc::new(DisplayContext::spawn());
    let inference = Arc::new(InferenceAdapter::new(classifier, 4).unwrap());
    let controller = SourceController::new(
        config,
        ControllerDeps {
            opener,
            events: events.clone(),
            display: display.clone(),
            inference: Arc::clone(&inference),
        },
    )
    .unwrap();

    Harness {
        controller,
        display,
        inference,
        events,
        temp_dir,
    }
}

pub(super) fn harness() -> Harness {
    harness_with(Arc::new(NullClassifier), Arc::new(DefaultBackendOpener), |_| {})
}

async fn wait_until<F: FnMut() -> bool>(mut condition: F) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

pub(super) fn drain(receiver: &mut broadcast::Receiver<InspectionEvent>) -> Vec<InspectionEvent> {
    let mut events = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return events,
        }
    }
}

fn frame(sequence: u64) -> Frame {
    Frame::new(sequence, SystemTime::now(), vec![100; 4], 2, 2, PixelFormat::Mono8)
}

#[tokio::test]
async fn test_frames_displayed_in_capture_order() {
    let marshal = Arc::new(InlineMarshal::default());
    let inference = Arc::new(InferenceAdapter::new(Arc::new(NullClassifier), 8).unwrap());
    let displayed = Arc::new(Mutex::new(None));
    let handler = FrameHandler::new(marshal.clone(), Arc::clone(&inference), Arc::clone(&displayed));

    for sequence in 1..=5 {
        handler.on_frame(frame(sequence)).unwrap();
    }

    assert_eq!(*marshal.shown.lock(), vec![1, 2, 3, 4, 5]);
    assert_eq!(marshal.state.lock().frames_displayed, 5);
    assert_eq!(displayed.lock().as_ref().map(|f| f.sequence), Some(5));
    assert!(inference.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(inference.stats().submitted, 5);

    let released = Frame::new(6, SystemTime::now(), Vec::new(), 2, 2, PixelFormat::Mono8);
    assert!(matches!(handler.on_frame(released), Err(CaptureError::Released)));
    assert_eq!(marshal.state.lock().frames_displayed, 5);
}

#[tokio::test]
async fn test_display_context_preserves_order() {
    let display = DisplayContext::spawn();
    let seen = Arc::new(Mutex::new(Vec::new()));
    for sequence in 1..=5 {
        let seen = Arc::clone(&seen);
        display.post(Box::new(move |state: &mut DisplayState| {
            state.show(frame(sequence));
            seen.lock().push(sequence);
        }));
    }
    display.flush().await;

    assert_eq!(*seen.lock(), vec![1, 2, 3, 4, 5]);
    let state = display.state();
    assert_eq!(state.frames_displayed, 5);
    assert_eq!(state.current_frame.map(|f| f.sequence), Some(5));
    display.shutdown().await;
}

#[tokio::test]
async fn test_command_guards() {
    let mut h = harness();
    let controller = &mut h.controller;

    assert_eq!(controller.state(), CaptureState::Disconnected);
    assert!(controller.can_start_capture());
    assert!(!controller.can_stop_capture());
    assert!(!controller.can_capture_snapshot());
    assert!(!controller.stop_capture().await);
    assert!(controller.capture_snapshot().await.is_err());

    // Start connects first
    assert!(controller.start_capture());
    assert_eq!(controller.state(), CaptureState::Capturing);
    assert!(!controller.can_start_capture());
    assert!(!controller.start_capture());

    let display = Arc::clone(&h.display);
    assert!(wait_until(|| display.state().frames_displayed >= 3).await);
    assert!(controller.can_capture_snapshot());

    let snapshot = controller.capture_snapshot().await.unwrap();
    assert!(snapshot.starts_with(h.temp_dir.path().join("training").join("None")));
    assert!(snapshot.exists());

    assert!(controller.stop_capture().await);
    assert_eq!(controller.state(), CaptureState::Connected);
    assert!(!controller.can_capture_snapshot());

    h.controller.shutdown().await;
}

#[tokio::test]
async fn test_switch_source_stops_old_before_opening_new() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let opener = Arc::new(InstrumentedOpener {
        log: Arc::clone(&log),
    });
    let mut h = harness_with(Arc::new(NullClassifier), opener, |_| {});
    let mut receiver = h.events.subscribe();

    assert!(h.controller.start_capture());
    let display = Arc::clone(&h.display);
    assert!(wait_until(|| display.state().frames_displayed >= 2).await);

    assert!(h.controller.switch_source(SourceKind::File).await);
    assert_eq!(h.controller.kind(), SourceKind::File);
    assert_eq!(h.controller.state(), CaptureState::Connected);
    assert_eq!(
        *log.lock(),
        vec!["open hardware".to_string(), "close hardware".to_string(), "open file".to_string()]
    );

    // Nothing from the old source reaches the display after the reset
    h.display.flush().await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    h.display.flush().await;
    let state = h.display.state();
    assert_eq!(state.frames_displayed, 0);
    assert!(state.current_frame.is_none());
    assert_eq!(h.controller.prediction().frame_sequence, None);

    let switched: Vec<_> = drain(&mut receiver)
        .into_iter()
        .filter_map(|event| match event {
            InspectionEvent::SourceSwitched { from, to } => Some((from, to)),
            _ => None,
        })
        .collect();
    assert_eq!(switched, vec![(SourceKind::HardwareCamera, SourceKind::File)]);

    // The new source only delivers once started explicitly
    assert!(h.controller.start_capture());
    assert!(wait_until(|| display.state().current_frame.map(|f| f.width) == Some(4)).await);
    h.controller.shutdown().await;
}

#[tokio::test]
async fn test_switch_to_unavailable_source_stays_disconnected() {
    let mut h = harness_with(Arc::new(NullClassifier), Arc::new(DefaultBackendOpener), |config| {
        config.file.path = "/nonexistent/reel.clip".to_string();
    });

    assert!(h.controller.connect(None));
    assert!(!h.controller.switch_source(SourceKind::File).await);
    assert_eq!(h.controller.kind(), SourceKind::File);
    assert_eq!(h.controller.state(), CaptureState::Disconnected);
    assert!(!h.controller.start_capture());
    h.controller.shutdown().await;
}

#[tokio::test]
async fn test_threshold_boundary_drives_defect_state() {
    let mut h = harness_with(
        Arc::new(FixedClassifier {
            label: "Hole",
            confidence: 0.5,
        }),
        Arc::new(DefaultBackendOpener),
        |config| config.inference.confidence_threshold = 0.9,
    );
    assert!(h.controller.start_capture());
    assert!(wait_until(|| h.controller.prediction().label == "Hole").await);
    assert!(h.controller.stop_capture().await);
    assert!(h.inference.wait_idle(Duration::from_secs(5)).await);
    assert!(!h.controller.has_defect());

    let mut receiver = h.events.subscribe();
    h.controller.set_threshold(0.5);
    assert!(h.controller.has_defect());
    h.controller.set_threshold(0.51);
    assert!(!h.controller.has_defect());

    h.controller.set_threshold(2.0);
    assert_eq!(h.controller.threshold(), 1.0);
    h.controller.adjust_threshold(-0.5);
    assert!((h.controller.threshold() - 0.5).abs() < 1e-6);
    assert!(h.controller.has_defect());

    let changes: Vec<bool> = drain(&mut receiver)
        .into_iter()
        .filter_map(|event| match event {
            InspectionEvent::DefectStateChanged { active } => Some(active),
            _ => None,
        })
        .collect();
    assert_eq!(changes, vec![true, false, true]);
    h.controller.shutdown().await;
}

#[tokio::test]
async fn test_recording_through_controller() {
    let mut h = harness();
    assert!(!h.controller.start_recording());
    assert!(!h.controller.stop_recording());

    assert!(h.controller.start_capture());
    let display = Arc::clone(&h.display);
    assert!(wait_until(|| display.state().frames_displayed >= 3).await);

    assert!(h.controller.toggle_recording());
    assert!(h.controller.is_recording());
    assert!(h.controller.toggle_recording());
    assert!(!h.controller.is_recording());

    let clips = crate::recording::find_clips(&h.temp_dir.path().join("recordings")).unwrap();
    assert_eq!(clips.len(), 1);
    h.controller.shutdown().await;
}

#[tokio::test]
async fn test_unknown_codec_does_not_start_recording() {
    let mut h = harness_with(Arc::new(NullClassifier), Arc::new(DefaultBackendOpener), |config| {
        config.recording.codec = "prores".to_string();
    });
    assert!(h.controller.start_capture());
    assert!(!h.controller.start_recording());
    assert_eq!(h.controller.state(), CaptureState::Capturing);
    h.controller.shutdown().await;
}

#[tokio::test]
async fn test_record_on_defect() {
    let mut h = harness_with(
        Arc::new(FixedClassifier {
            label: "Tear",
            confidence: 0.95,
        }),
        Arc::new(DefaultBackendOpener),
        |config| config.recording.record_on_defect = true,
    );

    h.controller.handle_defect(true);
    assert!(!h.controller.is_recording());

    assert!(h.controller.start_capture());
    assert!(wait_until(|| h.controller.has_defect()).await);
    h.controller.handle_defect(true);
    assert!(h.controller.is_recording());

    assert!(h.controller.stop_capture().await);
    assert!(!h.controller.is_recording());
    h.controller.shutdown().await;
}

#[tokio::test]
async fn test_connect_with_picker() {
    let mut h = harness();
    assert!(!h.controller.connect_with_picker(&StaticPicker::new()).await);
    assert_eq!(h.controller.state(), CaptureState::Disconnected);

    let picker = StaticPicker::new().with(SourceKind::HardwareCamera, "stub://picked?width=4&height=4");
    assert!(h.controller.connect_with_picker(&picker).await);
    assert!(h.controller.status().description.unwrap_or_default().contains("picked"));
    h.controller.shutdown().await;
}

#[tokio::test]
async fn test_seek_and_reconfigure() {
    let mut h = harness();
    assert!(h.controller.switch_source(SourceKind::File).await);
    h.controller.seek(5).unwrap();

    assert!(h.controller.switch_source(SourceKind::NetworkCamera).await);
    assert!(matches!(h.controller.seek(1), Err(CaptureError::Unsupported { .. })));

    let mut config = h.controller.config().clone();
    config.inference.confidence_threshold = 0.25;
    h.controller.reconfigure(config.clone()).await.unwrap();
    assert!((h.controller.threshold() - 0.25).abs() < 1e-6);

    config.camera.fps = 0;
    assert!(h.controller.reconfigure(config).await.is_err());

    let status = h.controller.status();
    assert_eq!(status.kind, SourceKind::NetworkCamera);
    assert!(status.summary().contains("network camera"));
    h.controller.shutdown().await;
}
