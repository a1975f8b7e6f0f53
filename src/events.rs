use crate::error::EventBusError;
use crate::source::{CaptureState, SourceKind};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Commands entered by the operator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OperatorCommand {
    StartCapture,
    StopCapture,
    ToggleRecording,
    Snapshot,
    Switch(SourceKind),
    /// Shift the defect threshold by the given amount
    AdjustThreshold(f32),
    Quit,
}

/// Events published by the inspection pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InspectionEvent {
    /// A source opened its device, stream or file
    SourceConnected { kind: SourceKind, description: String },
    /// A source failed to open
    ConnectFailed { kind: SourceKind, error: String },
    SourceDisconnected { kind: SourceKind },
    CaptureStateChanged { kind: SourceKind, state: CaptureState },
    SourceSwitched { from: SourceKind, to: SourceKind },
    /// Operator-facing status line
    StatusMessage { message: String },
    PredictionUpdated {
        label: String,
        confidence: f32,
        sequence: u64,
    },
    DefectStateChanged { active: bool },
    RecordingStarted {
        kind: SourceKind,
        path: String,
        preroll_frames: usize,
    },
    RecordingStopped {
        kind: SourceKind,
        path: String,
        frames: u64,
        reason: String,
    },
    RecordingFailed { kind: SourceKind, error: String },
    /// Processing a frame overran its playback budget
    SlowProcessing { kind: SourceKind, overrun_ms: u64 },
    /// A non-looping file reached its last frame
    PlaybackFinished { kind: SourceKind },
    SnapshotSaved { path: String, label: String },
    OperatorCommand { command: OperatorCommand },
    ShutdownRequested {
        timestamp: SystemTime,
        reason: String,
    },
}

impl InspectionEvent {
    /// Get a human-readable description of the event
    pub fn description(&self) -> String {
        match self {
            InspectionEvent::SourceConnected { kind, description } => {
                format!("{} connected: {}", kind, description)
            }
            InspectionEvent::ConnectFailed { kind, error } => {
                format!("{} failed to connect: {}", kind, error)
            }
            InspectionEvent::SourceDisconnected { kind } => format!("{} disconnected", kind),
            InspectionEvent::CaptureStateChanged { kind, state } => {
                format!("{} is now {:?}", kind, state)
            }
            InspectionEvent::SourceSwitched { from, to } => {
                format!("Switched source from {} to {}", from, to)
            }
            InspectionEvent::StatusMessage { message } => message.clone(),
            InspectionEvent::PredictionUpdated {
                label, confidence, ..
            } => format!("Prediction {} ({:.2})", label, confidence),
            InspectionEvent::DefectStateChanged { active } => {
                if *active {
                    "Defect detected".to_string()
                } else {
                    "Defect cleared".to_string()
                }
            }
            InspectionEvent::RecordingStarted {
                path,
                preroll_frames,
                ..
            } => format!(
                "Recording started: {} ({} pre-roll frames)",
                path, preroll_frames
            ),
            InspectionEvent::RecordingStopped {
                path,
                frames,
                reason,
                ..
            } => format!("Recording stopped ({}): {} ({} frames)", reason, path, frames),
            InspectionEvent::RecordingFailed { error, .. } => {
                format!("Recording failed: {}", error)
            }
            InspectionEvent::SlowProcessing { kind, overrun_ms } => {
                format!("{} frame processing overran by {}ms", kind, overrun_ms)
            }
            InspectionEvent::PlaybackFinished { kind } => format!("{} playback finished", kind),
            InspectionEvent::SnapshotSaved { path, label } => {
                format!("Snapshot saved as {}: {}", label, path)
            }
            InspectionEvent::OperatorCommand { command } => {
                format!("Operator command: {:?}", command)
            }
            InspectionEvent::ShutdownRequested { reason, .. } => {
                format!("Shutdown requested: {}", reason)
            }
        }
    }

    /// Get the event type as a string for filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            InspectionEvent::SourceConnected { .. } => "source_connected",
            InspectionEvent::ConnectFailed { .. } => "connect_failed",
            InspectionEvent::SourceDisconnected { .. } => "source_disconnected",
            InspectionEvent::CaptureStateChanged { .. } => "capture_state_changed",
            InspectionEvent::SourceSwitched { .. } => "source_switched",
            InspectionEvent::StatusMessage { .. } => "status_message",
            InspectionEvent::PredictionUpdated { .. } => "prediction_updated",
            InspectionEvent::DefectStateChanged { .. } => "defect_state_changed",
            InspectionEvent::RecordingStarted { .. } => "recording_started",
            InspectionEvent::RecordingStopped { .. } => "recording_stopped",
            InspectionEvent::RecordingFailed { .. } => "recording_failed",
            InspectionEvent::SlowProcessing { .. } => "slow_processing",
            InspectionEvent::PlaybackFinished { .. } => "playback_finished",
            InspectionEvent::SnapshotSaved { .. } => "snapshot_saved",
            InspectionEvent::OperatorCommand { .. } => "operator_command",
            InspectionEvent::ShutdownRequested { .. } => "shutdown_requested",
        }
    }

    pub fn status<S: Into<String>>(message: S) -> Self {
        InspectionEvent::StatusMessage {
            message: message.into(),
        }
    }
}

/// Broadcast event bus for component coordination.
///
/// Publishing is synchronous so capture threads outside the runtime can use it.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<InspectionEvent>,
}

impl EventBus {
    /// Create a new event bus with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InspectionEvent> {
        self.sender.subscribe()
    }

    /// Subscribe with a filter applied on receive
    pub fn subscribe_filtered<S: Into<String>>(&self, filter: EventFilter, name: S) -> EventReceiver {
        EventReceiver::new(self.sender.subscribe(), filter, name.into())
    }

    /// Publish an event, returning the number of receivers it reached
    pub fn publish(&self, event: InspectionEvent) -> usize {
        match &event {
            InspectionEvent::SourceConnected { kind, description } => {
                info!("{} connected: {}", kind, description);
            }
            InspectionEvent::ConnectFailed { kind, error } => {
                warn!("{} failed to connect: {}", kind, error);
            }
            InspectionEvent::StatusMessage { message } => {
                info!("Status: {}", message);
            }
            InspectionEvent::RecordingFailed { kind, error } => {
                warn!("Recording on {} failed: {}", kind, error);
            }
            InspectionEvent::ShutdownRequested { reason, .. } => {
                info!("Shutdown requested: {}", reason);
            }
            _ => debug!("Event: {}", event.description()),
        }

        // No receivers is not an error
        self.sender.send(event).unwrap_or(0)
    }
}

/// Event filter for selective event handling
#[derive(Debug, Clone)]
pub enum EventFilter {
    /// Accept all events
    All,
    /// Accept only specific event types
    EventTypes(Vec<&'static str>),
}

impl EventFilter {
    /// Check if an event passes this filter
    pub fn matches(&self, event: &InspectionEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::EventTypes(types) => types.contains(&event.event_type()),
        }
    }
}

/// Event receiver with filtering
pub struct EventReceiver {
    receiver: broadcast::Receiver<InspectionEvent>,
    filter: EventFilter,
    name: String,
}

impl EventReceiver {
    pub fn new(
        receiver: broadcast::Receiver<InspectionEvent>,
        filter: EventFilter,
        name: String,
    ) -> Self {
        Self {
            receiver,
            filter,
            name,
        }
    }

    /// Receive the next filtered event
    pub async fn recv(&mut self) -> Result<InspectionEvent, EventBusError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        debug!(
                            "Receiver '{}' received event: {}",
                            self.name,
                            event.description()
                        );
                        return Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Receiver '{}' lagged behind by {} events", self.name, n);
                    return Err(EventBusError::Lagged { missed: n });
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed for receiver '{}'", self.name);
                    return Err(EventBusError::ChannelClosed);
                }
            }
        }
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<Option<InspectionEvent>, EventBusError> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        return Ok(Some(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!("Receiver '{}' lagged behind by {} events", self.name, n);
                    return Err(EventBusError::Lagged { missed: n });
                }
                Err(broadcast::error::TryRecvError::Closed) => {
                    return Err(EventBusError::ChannelClosed);
                }
            }
        }
    }
}
