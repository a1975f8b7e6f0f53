/// Component lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl ComponentState {
    pub fn as_str(self) -> &'static str {
        match self {
            ComponentState::Stopped => "stopped",
            ComponentState::Starting => "starting",
            ComponentState::Running => "running",
            ComponentState::Stopping => "stopping",
            ComponentState::Failed => "failed",
        }
    }
}

/// Why the application is shutting down
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    Signal(String),
    Error(String),
    /// Quit key or a published shutdown request
    UserRequest,
}

/// What to do once the application has started
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Device, URL or file replacing the configured one
    pub path_override: Option<String>,
    pub start_capture: bool,
    pub record: bool,
}
