use crate::source::SourceKind;
use async_trait::async_trait;
use std::collections::HashMap;

/// Chooses a device, stream URL or file for a source kind.
///
/// Stands in for file dialogs and device enumeration; `None` means the
/// operator cancelled.
#[async_trait]
pub trait SourcePicker: Send + Sync {
    async fn pick(&self, kind: SourceKind) -> Option<String>;
}

/// Picker answering from a fixed table
#[derive(Debug, Clone, Default)]
pub struct StaticPicker {
    selections: HashMap<SourceKind, String>,
}

impl StaticPicker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<S: Into<String>>(mut self, kind: SourceKind, selector: S) -> Self {
        self.selections.insert(kind, selector.into());
        self
    }
}

#[async_trait]
impl SourcePicker for StaticPicker {
    async fn pick(&self, kind: SourceKind) -> Option<String> {
        self.selections.get(&kind).cloned()
    }
}
