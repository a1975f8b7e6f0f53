//! Orchestration of the active frame source: lifecycle commands, source
//! switching, and per-frame fan-out to display and inference.

mod core;
mod display;
mod picker;
mod training;
#[cfg(test)]
mod tests;

pub use self::core::{ControllerDeps, ControllerStatus, SourceController};
pub use display::{DisplayContext, DisplayJob, DisplayMarshal, DisplayState};
pub use picker::{SourcePicker, StaticPicker};
pub use training::{save_training_snapshot, snapshot_path};
