use super::backend::{BackendOpener, BackendRead, CaptureBackend};
use super::settings::SourceConfig;
use super::{CaptureState, SourceKind};
use crate::error::{CaptureError, InspectorError, RecordingError};
use crate::events::{EventBus, InspectionEvent};
use crate::frame::Frame;
use crate::recording::{RecordingRequest, RecordingSink, RecordingStarted, RecordingSummary, StopReason};
use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Observer receiving frames on the capture execution context.
///
/// Implementations must hand work off rather than block: the capture loop
/// waits for `on_frame` to return before reading the next frame.
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, frame: Frame) -> Result<(), CaptureError>;
}

impl<F> FrameSink for F
where
    F: Fn(Frame) -> Result<(), CaptureError> + Send + Sync,
{
    fn on_frame(&self, frame: Frame) -> Result<(), CaptureError> {
        self(frame)
    }
}

/// Proof of a registered subscriber; handed back to unsubscribe or dispose
#[derive(Debug)]
pub struct Subscription {
    source_id: Uuid,
    kind: SourceKind,
}

impl Subscription {
    pub fn kind(&self) -> SourceKind {
        self.kind
    }
}

/// Options shared by every source variant
#[derive(Clone)]
pub struct SourceOptions {
    /// Seconds of pre-roll kept for recordings
    pub preroll_seconds: u32,
    pub events: Option<EventBus>,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            preroll_seconds: 5,
            events: None,
        }
    }
}

/// Snapshot of per-source counters
#[derive(Debug, Clone, PartialEq)]
pub struct SourceStats {
    pub kind: SourceKind,
    pub state: CaptureState,
    pub frames_captured: u64,
    pub frames_delivered: u64,
    pub read_failures: u64,
    pub sink_errors: u64,
    pub benign_skips: u64,
    pub slow_frames: u64,
    pub reopens: u64,
    pub measured_fps: f64,
    pub preroll_frames: usize,
    pub recording: bool,
}

#[derive(Default)]
struct Counters {
    frames_captured: AtomicU64,
    frames_delivered: AtomicU64,
    read_failures: AtomicU64,
    sink_errors: AtomicU64,
    benign_skips: AtomicU64,
    slow_frames: AtomicU64,
    reopens: AtomicU64,
    measured_fps_bits: AtomicU64,
}

/// Everything behind the per-source lock: the backend handle and the recorder
pub(super) struct DeviceSlot {
    pub(super) backend: Option<Box<dyn CaptureBackend>>,
    pub(super) recording: RecordingSink,
}

pub(super) enum ReadOutcome {
    Frame(Frame),
    EndOfStream,
    Failed(CaptureError),
    /// Backend released underneath the loop
    Closed,
}

/// State shared between a source and its capture loop
pub(super) struct SourceShared {
    pub(super) id: Uuid,
    pub(super) kind: SourceKind,
    state: Mutex<CaptureState>,
    device: Mutex<DeviceSlot>,
    subscriber: RwLock<Option<Arc<dyn FrameSink>>>,
    sequence: AtomicU64,
    counters: Counters,
    events: Option<EventBus>,
}

impl SourceShared {
    pub(super) fn state(&self) -> CaptureState {
        *self.state.lock()
    }

    fn set_state(&self, state: CaptureState) {
        let previous = {
            let mut current = self.state.lock();
            std::mem::replace(&mut *current, state)
        };
        if previous != state {
            debug!("{} state {:?} -> {:?}", self.kind, previous, state);
            self.publish(InspectionEvent::CaptureStateChanged {
                kind: self.kind,
                state,
            });
        }
    }

    pub(super) fn publish(&self, event: InspectionEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    /// Read one frame under the lock, stamp it, and feed the recorder
    pub(super) fn read_next(&self) -> ReadOutcome {
        let mut closed_session = None;
        let outcome = {
            let mut slot = self.device.lock();
            let DeviceSlot { backend, recording } = &mut *slot;
            let Some(backend) = backend.as_mut() else {
                return ReadOutcome::Closed;
            };

            match backend.read_frame() {
                Ok(BackendRead::Frame(mut frame)) => {
                    frame.sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
                    self.counters.frames_captured.fetch_add(1, Ordering::Relaxed);
                    closed_session = recording.push_frame(&frame);
                    ReadOutcome::Frame(frame)
                }
                Ok(BackendRead::EndOfStream) => ReadOutcome::EndOfStream,
                Err(e) => {
                    self.counters.read_failures.fetch_add(1, Ordering::Relaxed);
                    ReadOutcome::Failed(e)
                }
            }
        };

        if let Some(summary) = closed_session {
            self.publish_recording_stopped(&summary);
        }
        outcome
    }

    /// Hand a frame to the subscriber, containing any failure it raises
    pub(super) fn deliver(&self, frame: Frame) {
        let sink = self.subscriber.read().clone();
        let Some(sink) = sink else {
            trace!("No subscriber for {} frame {}", self.kind, frame.sequence);
            return;
        };

        let sequence = frame.sequence;
        match catch_unwind(AssertUnwindSafe(|| sink.on_frame(frame))) {
            Ok(Ok(())) => {
                self.counters.frames_delivered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) if e.is_benign() => {
                debug!("Skipped released frame {} from {}", sequence, self.kind);
                self.counters.benign_skips.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                warn!("Frame handler failed for {} frame {}: {}", self.kind, sequence, e);
                self.counters.sink_errors.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                error!("Frame handler panicked on {} frame {}", self.kind, sequence);
                self.counters.sink_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub(super) fn seek(&self, position: u64) -> Result<(), CaptureError> {
        let mut slot = self.device.lock();
        let backend = slot.backend.as_mut().ok_or(CaptureError::NotConnected)?;
        backend.seek(position)
    }

    /// Replace the backend with a freshly opened one
    pub(super) fn reopen(
        &self,
        opener: &dyn BackendOpener,
        config: &SourceConfig,
        path_override: Option<&str>,
    ) -> Result<(), CaptureError> {
        let backend = opener.open(config, path_override)?;
        let description = backend.describe();
        {
            let mut slot = self.device.lock();
            if slot.backend.is_none() {
                // Disconnected while reopening
                return Err(CaptureError::NotConnected);
            }
            slot.backend = Some(backend);
        }
        self.counters.reopens.fetch_add(1, Ordering::Relaxed);
        info!("Reopened {} backend: {}", self.kind, description);
        Ok(())
    }

    /// End of a non-looping file: close any recording and fall back to Connected
    pub(super) fn finish_playback(&self) {
        self.close_recording(StopReason::CaptureStopped);
        self.set_state(CaptureState::Connected);
        self.publish(InspectionEvent::PlaybackFinished { kind: self.kind });
        info!("{} playback reached end of stream", self.kind);
    }

    pub(super) fn record_slow_frame(&self, overrun: Duration) {
        let count = self.counters.slow_frames.fetch_add(1, Ordering::Relaxed) + 1;
        if count == 1 || count % 100 == 0 {
            warn!(
                "{} frame processing overran its budget by {:?} ({} slow frames)",
                self.kind, overrun, count
            );
        }
        self.publish(InspectionEvent::SlowProcessing {
            kind: self.kind,
            overrun_ms: overrun.as_millis() as u64,
        });
    }

    pub(super) fn set_measured_fps(&self, fps: f64) {
        self.counters
            .measured_fps_bits
            .store(fps.to_bits(), Ordering::Relaxed);
    }

    /// Rate reported by the open backend
    pub(super) fn backend_fps(&self) -> Option<f64> {
        self.device.lock().backend.as_ref().and_then(|b| b.fps())
    }

    fn close_recording(&self, reason: StopReason) {
        let result = self.device.lock().recording.stop(reason);
        match result {
            Ok(summary) => self.publish_recording_stopped(&summary),
            Err(RecordingError::NotActive) => {}
            Err(e) => {
                warn!("Failed to close {} recording: {}", self.kind, e);
                self.publish(InspectionEvent::RecordingFailed {
                    kind: self.kind,
                    error: e.to_string(),
                });
            }
        }
    }

    fn publish_recording_stopped(&self, summary: &RecordingSummary) {
        self.publish(InspectionEvent::RecordingStopped {
            kind: self.kind,
            path: summary.path.display().to_string(),
            frames: summary.total_frames,
            reason: summary.stop_reason.to_string(),
        });
    }
}

/// Running capture loop
pub(super) struct CaptureWorker {
    pub(super) cancel: CancellationToken,
    pub(super) handle: JoinHandle<()>,
}

/// What a capture loop needs besides the shared state
#[derive(Clone)]
pub(super) struct LoopContext {
    pub(super) shared: Arc<SourceShared>,
    pub(super) opener: Arc<dyn BackendOpener>,
    pub(super) config: SourceConfig,
    pub(super) path_override: Option<String>,
    pub(super) cancel: CancellationToken,
}

/// Lifecycle common to all variants
pub(crate) struct SourceCore {
    shared: Arc<SourceShared>,
    opener: Arc<dyn BackendOpener>,
    config: SourceConfig,
    path_override: Option<String>,
    worker: Option<CaptureWorker>,
}

impl SourceCore {
    pub(super) fn new(
        config: SourceConfig,
        opener: Arc<dyn BackendOpener>,
        options: SourceOptions,
    ) -> Result<Self, InspectorError> {
        let kind = config.kind();
        let recording = RecordingSink::new(options.preroll_seconds, config.fps())?;

        Ok(Self {
            shared: Arc::new(SourceShared {
                id: Uuid::new_v4(),
                kind,
                state: Mutex::new(CaptureState::Disconnected),
                device: Mutex::new(DeviceSlot {
                    backend: None,
                    recording,
                }),
                subscriber: RwLock::new(None),
                sequence: AtomicU64::new(0),
                counters: Counters::default(),
                events: options.events,
            }),
            opener,
            config,
            path_override: None,
            worker: None,
        })
    }

    pub(super) fn kind(&self) -> SourceKind {
        self.shared.kind
    }

    pub(super) fn state(&self) -> CaptureState {
        self.shared.state()
    }

    pub(super) fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub(super) fn shared(&self) -> &Arc<SourceShared> {
        &self.shared
    }

    pub(super) fn connect(&mut self, path_override: Option<&str>) -> bool {
        let state = self.state();
        if state != CaptureState::Disconnected {
            debug!("{} already {:?}, connect is a no-op", self.kind(), state);
            return true;
        }

        info!(
            "Connecting {} to {}",
            self.kind(),
            path_override
                .map(str::to_string)
                .unwrap_or_else(|| self.config.display_selector())
        );

        let mut backend = match self.opener.open(&self.config, path_override) {
            Ok(backend) => backend,
            Err(e) => {
                self.shared.publish(InspectionEvent::ConnectFailed {
                    kind: self.kind(),
                    error: e.to_string(),
                });
                return false;
            }
        };

        if let Some(tuning) = self.config.tuning() {
            if let Err(e) = backend.apply_tuning(tuning) {
                warn!("Failed to apply camera tuning: {}", e);
            }
        }

        let description = backend.describe();
        {
            let mut slot = self.shared.device.lock();
            let fps = backend.fps().unwrap_or_else(|| self.config.fps());
            slot.recording.set_source_fps(fps);
            slot.backend = Some(backend);
        }

        self.path_override = path_override.map(str::to_string);
        self.shared.set_state(CaptureState::Connected);
        self.shared.publish(InspectionEvent::SourceConnected {
            kind: self.kind(),
            description,
        });
        true
    }

    pub(super) async fn disconnect(&mut self) {
        self.stop_capture().await;

        self.shared.close_recording(StopReason::CaptureStopped);
        let released = {
            let mut slot = self.shared.device.lock();
            slot.recording.clear_preroll();
            slot.backend.take()
        };

        if self.state() != CaptureState::Disconnected || released.is_some() {
            drop(released);
            self.shared.set_state(CaptureState::Disconnected);
            self.shared.publish(InspectionEvent::SourceDisconnected { kind: self.kind() });
            info!("{} disconnected", self.kind());
        }
    }

    /// Spawn a capture loop via `spawn`, unless not connected or already capturing
    pub(super) fn start_with<F>(&mut self, spawn: F) -> bool
    where
        F: FnOnce(LoopContext) -> JoinHandle<()>,
    {
        match self.state() {
            CaptureState::Disconnected => {
                warn!("Cannot start {} capture: not connected", self.kind());
                self.shared
                    .publish(InspectionEvent::status(format!("{} is not connected", self.kind())));
                return false;
            }
            CaptureState::Capturing => {
                debug!("{} is already capturing", self.kind());
                return false;
            }
            CaptureState::Connected => {}
        }

        if tokio::runtime::Handle::try_current().is_err() {
            error!("Cannot start {} capture outside a tokio runtime", self.kind());
            return false;
        }

        // A loop that ended on its own (end of file) has already exited
        if let Some(finished) = self.worker.take() {
            finished.cancel.cancel();
        }

        let cancel = CancellationToken::new();
        let context = LoopContext {
            shared: Arc::clone(&self.shared),
            opener: Arc::clone(&self.opener),
            config: self.config.clone(),
            path_override: self.path_override.clone(),
            cancel: cancel.clone(),
        };

        self.shared.set_state(CaptureState::Capturing);
        let handle = spawn(context);
        self.worker = Some(CaptureWorker { cancel, handle });

        info!("{} capture started", self.kind());
        true
    }

    pub(super) async fn stop_capture(&mut self) {
        let Some(worker) = self.worker.take() else {
            if self.state() == CaptureState::Capturing {
                self.shared.set_state(CaptureState::Connected);
            }
            return;
        };

        worker.cancel.cancel();
        if let Err(e) = worker.handle.await {
            error!("{} capture loop ended abnormally: {}", self.kind(), e);
        }

        self.shared.close_recording(StopReason::CaptureStopped);
        if self.state() == CaptureState::Capturing {
            self.shared.set_state(CaptureState::Connected);
            info!("{} capture stopped", self.kind());
        }
    }

    /// Returns true when capture was running and must be restarted by the variant
    pub(super) async fn reconfigure(&mut self, config: SourceConfig, live_tuning: bool) -> Result<bool, CaptureError> {
        if config.kind() != self.kind() {
            return Err(CaptureError::Backend {
                details: format!(
                    "cannot reconfigure a {} source with {} settings",
                    self.kind(),
                    config.kind()
                ),
            });
        }
        if config == self.config {
            return Ok(false);
        }

        let previous = std::mem::replace(&mut self.config, config);
        let state = self.state();
        if state == CaptureState::Disconnected {
            return Ok(false);
        }

        if live_tuning && previous.differs_only_in_tuning(&self.config) {
            if let Some(tuning) = self.config.tuning() {
                let mut slot = self.shared.device.lock();
                if let Some(backend) = slot.backend.as_mut() {
                    backend.apply_tuning(tuning)?;
                }
            }
            info!("Applied new {} tuning", self.kind());
            return Ok(false);
        }

        info!("Reopening {} with new settings", self.kind());
        let path_override = self.path_override.clone();
        self.disconnect().await;
        if !self.connect(path_override.as_deref()) {
            return Err(CaptureError::Open {
                source_desc: self.config.display_selector(),
                details: "reconnect after reconfigure failed".to_string(),
            });
        }
        Ok(state == CaptureState::Capturing)
    }

    pub(super) fn subscribe(&mut self, sink: Arc<dyn FrameSink>) -> Result<Subscription, CaptureError> {
        let mut subscriber = self.shared.subscriber.write();
        if subscriber.is_some() {
            return Err(CaptureError::AlreadySubscribed);
        }
        *subscriber = Some(sink);
        debug!("Subscriber attached to {}", self.kind());
        Ok(Subscription {
            source_id: self.shared.id,
            kind: self.kind(),
        })
    }

    pub(super) async fn unsubscribe(&mut self, subscription: Subscription) {
        if subscription.source_id != self.shared.id {
            warn!(
                "Ignoring unsubscribe with a {} subscription from another source",
                subscription.kind
            );
            return;
        }
        *self.shared.subscriber.write() = None;
        debug!("Subscriber detached from {}", self.kind());
    }

    pub(super) fn start_recording(&self, request: &RecordingRequest) -> Result<RecordingStarted, RecordingError> {
        if self.state() != CaptureState::Capturing {
            return Err(RecordingError::NotCapturing);
        }

        let result = {
            let mut slot = self.shared.device.lock();
            let DeviceSlot { backend, recording } = &mut *slot;
            let backend = backend.as_ref().ok_or(RecordingError::NotCapturing)?;

            let latest = recording.latest_frame();
            let frame_size = backend
                .frame_size()
                .filter(|(w, h)| *w > 0 && *h > 0)
                .or_else(|| latest.map(|f| (f.width, f.height)))
                .ok_or_else(|| RecordingError::WriterOpen {
                    path: request.output_path.display().to_string(),
                    details: "frame size unknown until the first frame arrives".to_string(),
                })?;
            let format = latest.map(|f| f.format).unwrap_or_else(|| backend.pixel_format());
            let fps = backend.fps().or(Some(self.config.fps()));

            recording.start(request, frame_size, format, fps)
        };

        match &result {
            Ok(started) => self.shared.publish(InspectionEvent::RecordingStarted {
                kind: self.kind(),
                path: started.path.display().to_string(),
                preroll_frames: started.preroll_frames,
            }),
            Err(e) => {
                warn!("{} recording failed to start: {}", self.kind(), e);
                self.shared.publish(InspectionEvent::RecordingFailed {
                    kind: self.kind(),
                    error: e.to_string(),
                });
            }
        }
        result
    }

    pub(super) fn stop_recording(&self) -> Result<RecordingSummary, RecordingError> {
        let summary = self.shared.device.lock().recording.stop(StopReason::Operator)?;
        self.shared.publish_recording_stopped(&summary);
        Ok(summary)
    }

    pub(super) fn is_recording(&self) -> bool {
        self.shared.device.lock().recording.is_active()
    }

    pub(super) fn describe(&self) -> Option<String> {
        self.shared.device.lock().backend.as_ref().map(|b| b.describe())
    }

    pub(super) fn position(&self) -> Option<u64> {
        self.shared.device.lock().backend.as_ref().and_then(|b| b.position())
    }

    pub(super) fn frame_count(&self) -> Option<u64> {
        self.shared.device.lock().backend.as_ref().and_then(|b| b.frame_count())
    }

    pub(super) fn stats(&self) -> SourceStats {
        let counters = &self.shared.counters;
        let (preroll_frames, recording) = {
            let slot = self.shared.device.lock();
            (slot.recording.preroll_len(), slot.recording.is_active())
        };
        SourceStats {
            kind: self.kind(),
            state: self.state(),
            frames_captured: counters.frames_captured.load(Ordering::Relaxed),
            frames_delivered: counters.frames_delivered.load(Ordering::Relaxed),
            read_failures: counters.read_failures.load(Ordering::Relaxed),
            sink_errors: counters.sink_errors.load(Ordering::Relaxed),
            benign_skips: counters.benign_skips.load(Ordering::Relaxed),
            slow_frames: counters.slow_frames.load(Ordering::Relaxed),
            reopens: counters.reopens.load(Ordering::Relaxed),
            measured_fps: f64::from_bits(counters.measured_fps_bits.load(Ordering::Relaxed)),
            preroll_frames,
            recording,
        }
    }
}

impl Drop for SourceCore {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            // Dropped without dispose: the loop exits at its next check
            worker.cancel.cancel();
        }
    }
}

/// Sleep in short slices so a blocking loop notices cancellation promptly
pub(super) fn sleep_blocking(cancel: &CancellationToken, duration: Duration) {
    let slice = Duration::from_millis(20);
    let mut remaining = duration;
    while !remaining.is_zero() && !cancel.is_cancelled() {
        let step = remaining.min(slice);
        std::thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}

/// Sleep unless cancelled first; returns false when cancelled
/// `read_next` on the blocking pool; a stalled backend read must not hold an async worker
pub(super) async fn read_blocking(shared: &Arc<SourceShared>) -> ReadOutcome {
    let shared = Arc::clone(shared);
    match tokio::task::spawn_blocking(move || shared.read_next()).await {
        Ok(outcome) => outcome,
        Err(e) => ReadOutcome::Failed(CaptureError::Backend {
            details: format!("read task failed: {}", e),
        }),
    }
}

/// Reopen the backend from the blocking pool
pub(super) async fn reopen_blocking(context: &LoopContext) -> Result<(), CaptureError> {
    let shared = Arc::clone(&context.shared);
    let opener = Arc::clone(&context.opener);
    let config = context.config.clone();
    let path_override = context.path_override.clone();
    tokio::task::spawn_blocking(move || {
        shared.reopen(opener.as_ref(), &config, path_override.as_deref())
    })
    .await
    .map_err(|e| CaptureError::Backend {
        details: format!("reopen task failed: {}", e),
    })?
}

pub(super) async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
