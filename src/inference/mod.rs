//! Defect classification behind an opaque `predict(frame) -> label, confidence`
//! contract, run off the capture path.

mod adapter;
mod classifier;
#[cfg(test)]
mod tests;

pub use adapter::{InferenceAdapter, InferenceStats};
pub use classifier::{load_classifier, Classifier, LuminanceClassifier, ModelDescriptor, NullClassifier};

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Label reported when no defect is found
pub const NO_DEFECT_LABEL: &str = "None";

/// Raw classifier output for one frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub label: String,
    /// Clamped to [0, 1]
    pub confidence: f32,
}

impl Classification {
    pub fn new<S: Into<String>>(label: S, confidence: f32) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            label: label.into(),
            confidence,
        }
    }

    /// "No defect, zero confidence"
    pub fn none() -> Self {
        Self::new(NO_DEFECT_LABEL, 0.0)
    }
}

/// Latest completed inference as observed by the UI layer
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: String,
    pub confidence: f32,
    /// Submission order; newer results always carry a larger value
    pub sequence: u64,
    /// Capture sequence of the classified frame
    pub frame_sequence: Option<u64>,
    pub produced_at: SystemTime,
}

impl Prediction {
    /// Empty prediction that any submission after `sequence` replaces
    pub fn empty(sequence: u64) -> Self {
        Self {
            label: NO_DEFECT_LABEL.to_string(),
            confidence: 0.0,
            sequence,
            frame_sequence: None,
            produced_at: SystemTime::now(),
        }
    }

    pub(crate) fn from_classification(classification: Classification, sequence: u64, frame_sequence: u64) -> Self {
        Self {
            label: classification.label,
            confidence: classification.confidence,
            sequence,
            frame_sequence: Some(frame_sequence),
            produced_at: SystemTime::now(),
        }
    }

    /// A defect is active only for a real label at or above the threshold
    pub fn is_defect(&self, threshold: f32) -> bool {
        self.label != NO_DEFECT_LABEL && self.confidence >= threshold
    }
}

impl Default for Prediction {
    fn default() -> Self {
        Self::empty(0)
    }
}
