use super::display::{DisplayMarshal, DisplayState};
use super::picker::SourcePicker;
use super::training::save_training_snapshot;
use crate::config::InspectorConfig;
use crate::error::{CaptureError, InspectorError, Result};
use crate::events::{EventBus, InspectionEvent};
use crate::frame::Frame;
use crate::inference::{InferenceAdapter, InferenceStats, Prediction, NO_DEFECT_LABEL};
use crate::recording::{Codec, RecordingRequest};
use crate::source::{
    BackendOpener, CaptureState, FrameSink, FrameSource, SourceConfig, SourceKind, SourceOptions,
    SourceStats, Subscription,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Collaborators the controller is wired to
pub struct ControllerDeps {
    pub opener: Arc<dyn BackendOpener>,
    pub events: EventBus,
    pub display: Arc<dyn DisplayMarshal>,
    pub inference: Arc<InferenceAdapter>,
}

/// Snapshot for status lines and the operator console
#[derive(Debug, Clone)]
pub struct ControllerStatus {
    pub kind: SourceKind,
    pub state: CaptureState,
    pub description: Option<String>,
    pub recording: bool,
    pub threshold: f32,
    pub prediction: Prediction,
    pub has_defect: bool,
    pub source: Option<SourceStats>,
    pub inference: InferenceStats,
}

impl ControllerStatus {
    /// One-line summary
    pub fn summary(&self) -> String {
        let frames = self
            .source
            .as_ref()
            .map(|s| {
                format!(
                    "{} frames, {:.1} fps, {} failures",
                    s.frames_delivered, s.measured_fps, s.read_failures
                )
            })
            .unwrap_or_else(|| "no source".to_string());
        format!(
            "{} {:?} | {} | prediction {} ({:.2}) threshold {:.2}{}{}",
            self.kind,
            self.state,
            frames,
            self.prediction.label,
            self.prediction.confidence,
            self.threshold,
            if self.has_defect { " DEFECT" } else { "" },
            if self.recording { " REC" } else { "" }
        )
    }
}

/// Per-frame fan-out, run on the capture context
pub(super) struct FrameHandler {
    display: Arc<dyn DisplayMarshal>,
    inference: Arc<InferenceAdapter>,
    displayed: Arc<Mutex<Option<Frame>>>,
}

impl FrameHandler {
    pub(super) fn new(
        display: Arc<dyn DisplayMarshal>,
        inference: Arc<InferenceAdapter>,
        displayed: Arc<Mutex<Option<Frame>>>,
    ) -> Self {
        Self {
            display,
            inference,
            displayed,
        }
    }
}

impl FrameSink for FrameHandler {
    fn on_frame(&self, frame: Frame) -> std::result::Result<(), CaptureError> {
        if frame.is_released() {
            return Err(CaptureError::Released);
        }

        let shown = frame.clone();
        let displayed = Arc::clone(&self.displayed);
        let posted = self.display.post(Box::new(move |state: &mut DisplayState| {
            *displayed.lock() = Some(shown.clone());
            state.show(shown);
        }));
        if !posted {
            debug!("Display context unavailable, frame {} not shown", frame.sequence);
        }

        self.inference.submit(frame);
        Ok(())
    }
}

/// Threshold and the defect flag derived from it
struct DefectTracker {
    threshold: f32,
    active: bool,
}

struct ActiveSource {
    source: FrameSource,
    subscription: Subscription,
}

/// Owns the single active frame source and routes its frames to display,
/// inference and recording.
pub struct SourceController {
    config: InspectorConfig,
    kind: SourceKind,
    active: Option<ActiveSource>,
    path_override: Option<String>,
    opener: Arc<dyn BackendOpener>,
    events: EventBus,
    display: Arc<dyn DisplayMarshal>,
    inference: Arc<InferenceAdapter>,
    displayed: Arc<Mutex<Option<Frame>>>,
    defect: Arc<Mutex<DefectTracker>>,
    watcher: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl SourceController {
    /// Build the controller with a Disconnected source of the configured kind
    pub fn new(config: InspectorConfig, deps: ControllerDeps) -> Result<Self> {
        let kind = config.source.kind;
        let defect = Arc::new(Mutex::new(DefectTracker {
            threshold: config.inference.confidence_threshold.clamp(0.0, 1.0),
            active: false,
        }));

        let mut controller = Self {
            config,
            kind,
            active: None,
            path_override: None,
            opener: deps.opener,
            events: deps.events,
            display: deps.display,
            inference: deps.inference,
            displayed: Arc::new(Mutex::new(None)),
            defect,
            watcher: None,
            cancel: CancellationToken::new(),
        };

        controller.active = Some(controller.build_source(kind)?);
        controller.watcher = Some(controller.spawn_prediction_watcher());
        info!("Source controller ready with {}", kind);
        Ok(controller)
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn state(&self) -> CaptureState {
        self.active
            .as_ref()
            .map(|a| a.source.state())
            .unwrap_or(CaptureState::Disconnected)
    }

    pub fn config(&self) -> &InspectorConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Open the active source; `path_override` replaces the configured selector
    pub fn connect(&mut self, path_override: Option<&str>) -> bool {
        self.path_override = path_override.map(str::to_string);
        let Some(active) = self.active.as_mut() else {
            self.notify("No source to connect");
            return false;
        };

        if active.source.connect(path_override) {
            let description = active.source.describe().unwrap_or_default();
            self.notify(format!("Connected to {} {}", self.kind, description));
            true
        } else {
            self.notify(format!("Failed to connect to {}", self.kind));
            false
        }
    }

    /// Ask `picker` for a selector, then connect to it
    pub async fn connect_with_picker(&mut self, picker: &dyn SourcePicker) -> bool {
        match picker.pick(self.kind).await {
            Some(selector) => self.connect(Some(&selector)),
            None => {
                self.notify(format!("No {} selected", self.kind));
                false
            }
        }
    }

    pub async fn disconnect(&mut self) {
        if let Some(active) = self.active.as_mut() {
            active.source.disconnect().await;
        }
        self.reset_frame_state();
        self.notify(format!("{} disconnected", self.kind));
    }

    pub fn can_start_capture(&self) -> bool {
        self.active.is_some() && self.state() != CaptureState::Capturing
    }

    pub fn can_stop_capture(&self) -> bool {
        self.state() == CaptureState::Capturing
    }

    pub fn can_capture_snapshot(&self) -> bool {
        self.state() == CaptureState::Capturing && self.displayed.lock().is_some()
    }

    /// Begin capture, connecting first if needed
    pub fn start_capture(&mut self) -> bool {
        if self.active.is_none() {
            self.notify("No source to capture from");
            return false;
        }
        if !self.can_start_capture() {
            self.notify("Capture is already running");
            return false;
        }

        if self.state() == CaptureState::Disconnected {
            let path_override = self.path_override.clone();
            if !self.connect(path_override.as_deref()) {
                return false;
            }
        }

        let started = self
            .active
            .as_mut()
            .map(|a| a.source.start_capture())
            .unwrap_or(false);
        if started {
            self.notify(format!("{} capture started", self.kind));
        } else {
            self.notify(format!("Failed to start {} capture", self.kind));
        }
        started
    }

    pub async fn stop_capture(&mut self) -> bool {
        if !self.can_stop_capture() {
            self.notify("Capture is not running");
            return false;
        }
        if let Some(active) = self.active.as_mut() {
            active.source.stop_capture().await;
        }
        self.notify(format!("{} capture stopped", self.kind));
        true
    }

    /// Replace the active source with one of `kind`.
    ///
    /// The old source is fully stopped, unsubscribed and disconnected before
    /// the new one is built, so two sources never capture at once. The new
    /// source is left Connected (or Disconnected if opening failed).
    pub async fn switch_source(&mut self, kind: SourceKind) -> bool {
        let from = self.kind;
        info!("Switching source from {} to {}", from, kind);

        if let Some(ActiveSource { source, subscription }) = self.active.take() {
            source.dispose(subscription).await;
        }
        self.reset_frame_state();
        self.kind = kind;
        self.path_override = None;

        match self.build_source(kind) {
            Ok(active) => self.active = Some(active),
            Err(e) => {
                error!("Failed to create {} source: {}", kind, e);
                self.notify(format!("Failed to create {} source: {}", kind, e));
                return false;
            }
        }

        self.events.publish(InspectionEvent::SourceSwitched { from, to: kind });
        self.connect(None)
    }

    /// Jump to a frame of the playing file
    pub fn seek(&mut self, position: u64) -> std::result::Result<(), CaptureError> {
        let active = self.active.as_mut().ok_or(CaptureError::NotConnected)?;
        active.source.seek(position)?;
        self.notify(format!("Seeked to frame {}", position));
        Ok(())
    }

    /// Start recording the active source into the configured directory
    pub fn start_recording(&mut self) -> bool {
        let settings = &self.config.recording;
        let codec = match settings.codec.parse::<Codec>() {
            Ok(codec) => codec,
            Err(e) => {
                warn!("Recording not started: {}", e);
                self.notify(format!("Recording not started: {}", e));
                return false;
            }
        };

        let request = RecordingRequest::in_directory(&settings.path, self.kind.as_str(), codec)
            .with_fps(settings.fps)
            .with_quality(settings.quality)
            .with_max_duration_seconds(settings.max_duration_seconds);

        let Some(active) = self.active.as_ref() else {
            return false;
        };
        match active.source.start_recording(&request) {
            Ok(started) => {
                self.notify(format!(
                    "Recording to {} ({} pre-roll frames)",
                    started.path.display(),
                    started.preroll_frames
                ));
                true
            }
            Err(e) => {
                warn!("Recording not started: {}", e);
                self.notify(format!("Recording not started: {}", e));
                false
            }
        }
    }

    pub fn stop_recording(&mut self) -> bool {
        let Some(active) = self.active.as_ref() else {
            return false;
        };
        match active.source.stop_recording() {
            Ok(summary) => {
                self.notify(format!(
                    "Recording saved to {} ({} frames)",
                    summary.path.display(),
                    summary.total_frames
                ));
                true
            }
            Err(e) => {
                self.notify(format!("No recording to stop: {}", e));
                false
            }
        }
    }

    pub fn is_recording(&self) -> bool {
        self.active
            .as_ref()
            .map(|a| a.source.is_recording())
            .unwrap_or(false)
    }

    pub fn toggle_recording(&mut self) -> bool {
        if self.is_recording() {
            self.stop_recording()
        } else {
            self.start_recording()
        }
    }

    /// Save the displayed frame under the current defect label
    pub async fn capture_snapshot(&mut self) -> Result<PathBuf> {
        if !self.can_capture_snapshot() {
            self.notify("Snapshot needs a running capture with a displayed frame");
            return Err(InspectorError::component(
                "training",
                "no displayed frame while capturing",
            ));
        }
        let frame = self
            .displayed
            .lock()
            .clone()
            .ok_or_else(|| InspectorError::component("training", "no displayed frame"))?;

        let prediction = self.inference.current();
        let label = if prediction.is_defect(self.threshold()) {
            prediction.label
        } else {
            NO_DEFECT_LABEL.to_string()
        };

        let root = PathBuf::from(&self.config.training.path);
        let task_label = label.clone();
        let path = tokio::task::spawn_blocking(move || save_training_snapshot(&root, &task_label, &frame))
            .await
            .map_err(|e| InspectorError::component("training", format!("Snapshot task failed: {}", e)))??;

        self.events.publish(InspectionEvent::SnapshotSaved {
            path: path.display().to_string(),
            label,
        });
        Ok(path)
    }

    pub fn threshold(&self) -> f32 {
        self.defect.lock().threshold
    }

    /// Change the defect threshold and re-derive the defect flag
    pub fn set_threshold(&mut self, threshold: f32) {
        let threshold = threshold.clamp(0.0, 1.0);
        let prediction = self.inference.current();
        let changed = {
            let mut tracker = self.defect.lock();
            tracker.threshold = threshold;
            update_defect(&mut tracker, &prediction)
        };
        if let Some(active) = changed {
            self.events.publish(InspectionEvent::DefectStateChanged { active });
        }
        self.notify(format!("Defect threshold {:.2}", threshold));
    }

    pub fn adjust_threshold(&mut self, delta: f32) {
        let threshold = self.threshold() + delta;
        self.set_threshold(threshold);
    }

    /// Latest completed prediction
    pub fn prediction(&self) -> Prediction {
        self.inference.current()
    }

    /// Derived: a real label at or above the threshold
    pub fn has_defect(&self) -> bool {
        self.inference.current().is_defect(self.threshold())
    }

    /// React to a change of the defect flag (record-on-defect)
    pub fn handle_defect(&mut self, active: bool) {
        if active
            && self.config.recording.record_on_defect
            && self.state() == CaptureState::Capturing
            && !self.is_recording()
        {
            info!("Defect detected, starting recording");
            self.start_recording();
        }
    }

    /// Apply a new configuration. The active source receives a fresh snapshot.
    pub async fn reconfigure(&mut self, config: InspectorConfig) -> Result<()> {
        config.validate()?;
        let source_config = SourceConfig::from_settings(self.kind, &config);
        self.config = config;
        self.set_threshold(self.config.inference.confidence_threshold);

        if let Some(active) = self.active.as_mut() {
            active.source.reconfigure(source_config).await?;
        }
        info!("Controller reconfigured");
        Ok(())
    }

    pub fn status(&self) -> ControllerStatus {
        let prediction = self.inference.current();
        let threshold = self.threshold();
        let source = self.active.as_ref().map(|a| &a.source);
        ControllerStatus {
            kind: self.kind,
            state: self.state(),
            description: source.and_then(|s| s.describe()),
            recording: self.is_recording(),
            threshold,
            has_defect: prediction.is_defect(threshold),
            prediction,
            source: source.map(|s| s.stats()),
            inference: self.inference.stats(),
        }
    }

    /// Stop everything and release the source
    pub async fn shutdown(mut self) {
        info!("Shutting down source controller");
        if let Some(ActiveSource { source, subscription }) = self.active.take() {
            source.dispose(subscription).await;
        }

        self.cancel.cancel();
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.await;
        }

        if !self.inference.wait_idle(Duration::from_secs(2)).await {
            warn!("Inference jobs still running at shutdown");
        }
    }

    fn build_source(&self, kind: SourceKind) -> Result<ActiveSource> {
        let source_config = SourceConfig::from_settings(kind, &self.config);
        let options = SourceOptions {
            preroll_seconds: self.config.recording.preroll_seconds,
            events: Some(self.events.clone()),
        };
        let mut source = FrameSource::new(source_config, Arc::clone(&self.opener), options)?;

        let handler = FrameHandler::new(
            Arc::clone(&self.display),
            Arc::clone(&self.inference),
            Arc::clone(&self.displayed),
        );
        let subscription = source.subscribe(Arc::new(handler))?;
        Ok(ActiveSource { source, subscription })
    }

    fn reset_frame_state(&self) {
        *self.displayed.lock() = None;
        let displayed = Arc::clone(&self.displayed);
        self.display.post(Box::new(move |state: &mut DisplayState| {
            state.clear();
            *displayed.lock() = None;
        }));
        self.inference.reset();
    }

    /// Publishes each new prediction and flips the defect flag when it changes
    fn spawn_prediction_watcher(&self) -> JoinHandle<()> {
        let mut receiver = self.inference.subscribe();
        let events = self.events.clone();
        let defect = Arc::clone(&self.defect);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    changed = receiver.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }

                let prediction = receiver.borrow_and_update().clone();
                events.publish(InspectionEvent::PredictionUpdated {
                    label: prediction.label.clone(),
                    confidence: prediction.confidence,
                    sequence: prediction.sequence,
                });

                let changed = update_defect(&mut defect.lock(), &prediction);
                if let Some(active) = changed {
                    events.publish(InspectionEvent::DefectStateChanged { active });
                }
            }
            debug!("Prediction watcher exited");
        })
    }

    fn notify<S: Into<String>>(&self, message: S) {
        let message = message.into();
        info!("{}", message);
        self.events.publish(InspectionEvent::status(message));
    }
}

/// Recompute the defect flag; Some(new value) when it flipped
fn update_defect(tracker: &mut DefectTracker, prediction: &Prediction) -> Option<bool> {
    let active = prediction.is_defect(tracker.threshold);
    if active != tracker.active {
        tracker.active = active;
        Some(active)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::tests::{drain, harness};

    #[tokio::test]
    async fn test_start_without_source_reports_missing_source() {
        let mut h = harness();
        assert!(h.controller.start_capture());
        h.controller.stop_capture().await;

        // As left behind by a source that failed to build during a switch
        if let Some(ActiveSource { source, subscription }) = h.controller.active.take() {
            source.dispose(subscription).await;
        }
        let mut receiver = h.events.subscribe();

        assert!(!h.controller.can_start_capture());
        assert!(!h.controller.start_capture());
        assert_eq!(h.controller.state(), CaptureState::Disconnected);

        let messages: Vec<String> = drain(&mut receiver)
            .into_iter()
            .filter_map(|event| match event {
                InspectionEvent::StatusMessage { message } => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(messages, vec!["No source to capture from".to_string()]);
    }
}
