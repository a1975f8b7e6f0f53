use super::{ComponentState, InspectorApp, StartOptions};
use crate::error::{InspectorError, Result};
use tracing::{info, warn};

impl InspectorApp {
    /// Register components with their initial state
    pub async fn initialize(&mut self) -> Result<()> {
        info!("Initializing inspection components");

        self.set_component_state("display", ComponentState::Running);
        self.set_component_state("inference", ComponentState::Running);
        self.set_component_state("controller", ComponentState::Stopped);
        if self.console_enabled {
            self.set_component_state("console", ComponentState::Stopped);
        }

        info!("All components initialized successfully");
        Ok(())
    }

    /// Connect the configured source and apply the start options.
    ///
    /// A source that fails to open leaves the application running with the
    /// source Disconnected so the operator can switch or retry.
    pub async fn start(&mut self, options: StartOptions) -> Result<()> {
        info!("Starting cardboard inspection");
        self.set_component_state("controller", ComponentState::Starting);

        let controller = self
            .controller
            .as_mut()
            .ok_or_else(|| InspectorError::system("Controller already shut down"))?;

        if !controller.connect(options.path_override.as_deref()) {
            warn!("{} source did not connect; waiting for operator", controller.kind());
        } else if options.start_capture {
            if controller.start_capture() && options.record && !controller.start_recording() {
                warn!("Recording requested at startup but could not start");
            }
        }
        self.set_component_state("controller", ComponentState::Running);

        if self.console_enabled {
            self.set_component_state("console", ComponentState::Starting);
            if let Some(console) = self.console.as_mut() {
                console.start();
            }
            self.set_component_state("console", ComponentState::Running);
        }

        info!("Inspection started");
        Ok(())
    }
}
