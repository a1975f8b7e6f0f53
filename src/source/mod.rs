//! Frame sources: hardware camera, network stream and file playback.
//!
//! Each variant composes a [`core::SourceCore`] holding the backend handle,
//! recording sink and subscriber, and differs only in how its capture loop
//! paces reads.

mod backend;
mod core;
mod file;
#[cfg(all(feature = "gstreamer", target_os = "linux"))]
mod gst;
mod hardware;
mod network;
mod settings;
mod synthetic;

pub use backend::{BackendOpener, BackendRead, CaptureBackend, ClipFileBackend, DefaultBackendOpener};
pub use self::core::{FrameSink, SourceOptions, SourceStats, Subscription};
pub use settings::{
    authenticated_url, CameraTuning, FileConfig, HardwareCameraConfig, NetworkCameraConfig,
    SourceConfig,
};
pub use synthetic::{SyntheticBackend, SyntheticParams};

use self::core::SourceCore;
use crate::error::{CaptureError, RecordingError};
use crate::recording::{RecordingRequest, RecordingStarted, RecordingSummary};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Which source variant is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    HardwareCamera,
    NetworkCamera,
    File,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [
        SourceKind::HardwareCamera,
        SourceKind::NetworkCamera,
        SourceKind::File,
    ];

    /// Short name used in logs and CLI flags
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::HardwareCamera => "hardware",
            SourceKind::NetworkCamera => "network",
            SourceKind::File => "file",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceKind::HardwareCamera => "hardware camera",
            SourceKind::NetworkCamera => "network camera",
            SourceKind::File => "file",
        };
        f.write_str(name)
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "hardware" | "hardware_camera" | "camera" | "basler" => Ok(SourceKind::HardwareCamera),
            "network" | "network_camera" | "ip" | "ip_camera" | "rtsp" => {
                Ok(SourceKind::NetworkCamera)
            }
            "file" | "video" | "playback" => Ok(SourceKind::File),
            other => Err(format!(
                "unknown source kind '{}' (expected hardware, network or file)",
                other
            )),
        }
    }
}

/// Lifecycle state of a frame source.
///
/// Transitions: Disconnected -> Connected -> Capturing -> Connected -> Disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureState {
    Disconnected,
    Connected,
    Capturing,
}

/// A capture backend variant with a uniform lifecycle contract
pub enum FrameSource {
    HardwareCamera(hardware::HardwareCamera),
    NetworkCamera(network::NetworkCamera),
    File(file::FileSource),
}

impl FrameSource {
    /// Build the variant matching `config`, initially Disconnected
    pub fn new(
        config: SourceConfig,
        opener: Arc<dyn BackendOpener>,
        options: SourceOptions,
    ) -> crate::error::Result<Self> {
        let kind = config.kind();
        let core = SourceCore::new(config, opener, options)?;
        Ok(match kind {
            SourceKind::HardwareCamera => FrameSource::HardwareCamera(hardware::HardwareCamera::new(core)),
            SourceKind::NetworkCamera => FrameSource::NetworkCamera(network::NetworkCamera::new(core)),
            SourceKind::File => FrameSource::File(file::FileSource::new(core)),
        })
    }

    fn core(&self) -> &SourceCore {
        match self {
            FrameSource::HardwareCamera(source) => &source.core,
            FrameSource::NetworkCamera(source) => &source.core,
            FrameSource::File(source) => &source.core,
        }
    }

    fn core_mut(&mut self) -> &mut SourceCore {
        match self {
            FrameSource::HardwareCamera(source) => &mut source.core,
            FrameSource::NetworkCamera(source) => &mut source.core,
            FrameSource::File(source) => &mut source.core,
        }
    }

    pub fn kind(&self) -> SourceKind {
        self.core().kind()
    }

    pub fn state(&self) -> CaptureState {
        self.core().state()
    }

    pub fn config(&self) -> &SourceConfig {
        self.core().config()
    }

    /// Open the device, stream or file.
    ///
    /// Returns false (state stays Disconnected) when opening fails; calling it
    /// while already connected is a no-op that returns true.
    pub fn connect(&mut self, path_override: Option<&str>) -> bool {
        self.core_mut().connect(path_override)
    }

    /// Stop capture, close any recording and release the backend. Safe to repeat.
    pub async fn disconnect(&mut self) {
        self.core_mut().disconnect().await
    }

    /// Begin delivering frames to the subscriber.
    ///
    /// No-op returning false when not connected or already capturing.
    pub fn start_capture(&mut self) -> bool {
        match self {
            FrameSource::HardwareCamera(source) => source.start_capture(),
            FrameSource::NetworkCamera(source) => source.start_capture(),
            FrameSource::File(source) => source.start_capture(),
        }
    }

    /// Halt delivery. No frame reaches the subscriber after this returns.
    pub async fn stop_capture(&mut self) {
        self.core_mut().stop_capture().await
    }

    /// Jump to a frame index (file playback only)
    pub fn seek(&mut self, position: u64) -> Result<(), CaptureError> {
        match self {
            FrameSource::File(source) => source.seek(position),
            other => Err(CaptureError::Unsupported {
                operation: "seek",
                kind: other.kind().as_str(),
            }),
        }
    }

    /// Replace the configuration snapshot.
    ///
    /// Camera tuning is applied to an open hardware camera in place; any
    /// other change reopens the backend and resumes capture if it was running.
    pub async fn reconfigure(&mut self, config: SourceConfig) -> Result<(), CaptureError> {
        let live_tuning = matches!(self, FrameSource::HardwareCamera(_));
        if self.core_mut().reconfigure(config, live_tuning).await? {
            self.start_capture();
        }
        Ok(())
    }

    /// Register the frame observer; only one subscriber is allowed
    pub fn subscribe(&mut self, sink: Arc<dyn FrameSink>) -> Result<Subscription, CaptureError> {
        self.core_mut().subscribe(sink)
    }

    /// Detach the observer without disposing the source
    pub async fn unsubscribe(&mut self, subscription: Subscription) {
        self.core_mut().unsubscribe(subscription).await
    }

    /// Tear the source down: stop capture, unsubscribe, disconnect.
    ///
    /// Consumes both the source and its subscription so the observer is
    /// always detached before the source goes away.
    pub async fn dispose(mut self, subscription: Subscription) {
        let core = self.core_mut();
        core.stop_capture().await;
        core.unsubscribe(subscription).await;
        core.disconnect().await;
    }

    pub fn start_recording(&self, request: &RecordingRequest) -> Result<RecordingStarted, RecordingError> {
        self.core().start_recording(request)
    }

    pub fn stop_recording(&self) -> Result<RecordingSummary, RecordingError> {
        self.core().stop_recording()
    }

    pub fn is_recording(&self) -> bool {
        self.core().is_recording()
    }

    /// Backend description, e.g. the opened device or file
    pub fn describe(&self) -> Option<String> {
        self.core().describe()
    }

    /// Current frame index for file playback
    pub fn position(&self) -> Option<u64> {
        self.core().position()
    }

    /// Total frames for file playback
    pub fn frame_count(&self) -> Option<u64> {
        self.core().frame_count()
    }

    pub fn stats(&self) -> SourceStats {
        self.core().stats()
    }
}
