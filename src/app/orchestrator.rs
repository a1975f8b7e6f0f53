use super::console::OperatorConsole;
use super::types::{ComponentState, ShutdownReason};
use crate::config::InspectorConfig;
use crate::controller::{ControllerDeps, DisplayContext, SourceController};
use crate::error::Result;
use crate::events::EventBus;
use crate::inference::{load_classifier, InferenceAdapter};
use crate::source::{BackendOpener, DefaultBackendOpener};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Top-level application: owns every component and the shutdown channel
pub struct InspectorApp {
    pub(super) config: InspectorConfig,
    pub(super) events: EventBus,
    pub(super) display: Option<Arc<DisplayContext>>,
    pub(super) inference: Arc<InferenceAdapter>,

    // Components
    pub(super) controller: Option<SourceController>,
    pub(super) console: Option<OperatorConsole>,
    pub(super) console_enabled: bool,

    // Lifecycle management
    pub(super) component_states: BTreeMap<&'static str, ComponentState>,
    pub(super) shutdown_sender: Option<oneshot::Sender<ShutdownReason>>,
    pub(super) shutdown_receiver: Option<oneshot::Receiver<ShutdownReason>>,
    pub(super) cancellation_token: CancellationToken,
}

impl InspectorApp {
    /// Build the application with the platform capture backends
    pub async fn new(config: InspectorConfig) -> Result<Self> {
        Self::with_opener(config, Arc::new(DefaultBackendOpener)).await
    }

    /// Build the application with a custom backend opener
    pub async fn with_opener(config: InspectorConfig, opener: Arc<dyn BackendOpener>) -> Result<Self> {
        config.validate()?;

        let events = EventBus::new(config.system.event_bus_capacity);
        let display = Arc::new(DisplayContext::spawn());

        let classifier = load_classifier(&config.inference)?;
        let inference = Arc::new(InferenceAdapter::new(
            classifier,
            config.inference.max_in_flight,
        )?);
        info!("Inference classifier: {}", inference.classifier_name());

        let controller = SourceController::new(
            config.clone(),
            ControllerDeps {
                opener,
                events: events.clone(),
                display: display.clone(),
                inference: Arc::clone(&inference),
            },
        )?;

        let (shutdown_sender, shutdown_receiver) = oneshot::channel();

        Ok(Self {
            console: Some(OperatorConsole::new(events.clone())),
            config,
            events,
            display: Some(display),
            inference,
            controller: Some(controller),
            console_enabled: false,
            component_states: BTreeMap::new(),
            shutdown_sender: Some(shutdown_sender),
            shutdown_receiver: Some(shutdown_receiver),
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Enable or disable the keyboard console
    pub fn set_console_enabled(&mut self, enabled: bool) {
        self.console_enabled = enabled;
    }

    pub fn config(&self) -> &InspectorConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn display(&self) -> Option<&Arc<DisplayContext>> {
        self.display.as_ref()
    }

    pub fn controller(&self) -> Option<&SourceController> {
        self.controller.as_ref()
    }

    pub fn controller_mut(&mut self) -> Option<&mut SourceController> {
        self.controller.as_mut()
    }
}
