use super::{ComponentState, InspectorApp};
use tracing::debug;

impl InspectorApp {
    pub(super) fn set_component_state(&mut self, component: &'static str, state: ComponentState) {
        let previous = self.component_states.insert(component, state);
        if previous != Some(state) {
            debug!("Component '{}' is now {}", component, state.as_str());
        }
    }

    pub fn component_state(&self, component: &str) -> Option<ComponentState> {
        self.component_states.get(component).copied()
    }

    /// Controller summary followed by any component that is not running
    pub fn status_line(&self) -> String {
        let mut line = match self.controller.as_ref() {
            Some(controller) => controller.status().summary(),
            None => "controller shut down".to_string(),
        };

        let degraded: Vec<String> = self
            .component_states
            .iter()
            .filter(|(_, state)| **state != ComponentState::Running)
            .map(|(name, state)| format!("{} {}", name, state.as_str()))
            .collect();
        if !degraded.is_empty() {
            line.push_str(" | ");
            line.push_str(&degraded.join(", "));
        }
        line
    }
}
