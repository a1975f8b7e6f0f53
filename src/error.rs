use thiserror::Error;

#[derive(Error, Debug)]
pub enum InspectorError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Recording error: {0}")]
    Recording(#[from] RecordingError),

    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("System error: {message}")]
    System { message: String },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

impl InspectorError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn component<C: Into<String>, M: Into<String>>(component: C, message: M) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }
}

/// Errors raised by frame sources and their capture backends
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Failed to open {source_desc}: {details}")]
    Open { source_desc: String, details: String },

    #[error("Source is not connected")]
    NotConnected,

    #[error("{operation} is not supported by the {kind} source")]
    Unsupported {
        operation: &'static str,
        kind: &'static str,
    },

    #[error("Frame read failed: {details}")]
    Read { details: String },

    #[error("Frame buffer was already released")]
    Released,

    #[error("Frame source already has a subscriber")]
    AlreadySubscribed,

    #[error("Backend error: {details}")]
    Backend { details: String },
}

impl CaptureError {
    /// Released buffers are an expected race during teardown, not a fault
    pub fn is_benign(&self) -> bool {
        matches!(self, CaptureError::Released)
    }
}

/// Errors raised by the recording sink and clip container
#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("Failed to create recording directory {path}: {source}")]
    DirectoryCreation {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open writer for {path}: {details}")]
    WriterOpen { path: String, details: String },

    #[error("Write failed: {details}")]
    Write { details: String },

    #[error("Codec '{codec}' is not available in this build")]
    UnsupportedCodec { codec: String },

    #[error("Invalid clip file {path}: {details}")]
    Format { path: String, details: String },

    #[error("Recording is not active")]
    NotActive,

    #[error("Recording is already active")]
    AlreadyActive,

    #[error("Recording requires an active capture")]
    NotCapturing,
}

/// Errors raised by classifiers
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Failed to load model {path}: {details}")]
    ModelLoad { path: String, details: String },

    #[error("Unsupported input: {details}")]
    InvalidInput { details: String },

    #[error("Prediction failed: {details}")]
    Prediction { details: String },
}

/// Errors raised by event bus receivers
#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("Receiver lagged behind by {missed} events")]
    Lagged { missed: u64 },

    #[error("Event bus channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, InspectorError>;
