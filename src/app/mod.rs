//! Application wiring: event bus, display context, inference, the source
//! controller and the operator console, plus the run loop and shutdown.

pub mod console;

mod orchestrator;
mod runtime;
mod shutdown;
mod startup;
mod state;
mod types;

#[cfg(test)]
mod tests;

pub use console::{key_command, OperatorConsole, THRESHOLD_STEP};
pub use orchestrator::InspectorApp;
pub use types::{ComponentState, ShutdownReason, StartOptions};
