pub mod app;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod frame;
pub mod inference;
pub mod pacing;
pub mod preroll;
pub mod recording;
pub mod source;

pub use app::{InspectorApp, ShutdownReason, StartOptions};
pub use config::InspectorConfig;
pub use controller::{ControllerStatus, SourceController};
pub use error::{CaptureError, InferenceError, InspectorError, RecordingError, Result};
pub use events::{EventBus, EventFilter, EventReceiver, InspectionEvent, OperatorCommand};
pub use frame::{Frame, PixelFormat};
pub use inference::{InferenceAdapter, Prediction};
pub use source::{CaptureState, FrameSource, SourceConfig, SourceKind};
