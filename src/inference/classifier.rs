use super::{Classification, NO_DEFECT_LABEL};
use crate::config::InferenceSettings;
use crate::error::InferenceError;
use crate::frame::Frame;
use image::imageops::{self, FilterType};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Opaque image classifier. `predict` may block; it is only ever called from
/// the blocking pool.
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    fn predict(&self, frame: &Frame) -> Result<Classification, InferenceError>;
}

/// Used when inference is disabled: every frame is clean
#[derive(Debug, Default, Clone, Copy)]
pub struct NullClassifier;

impl Classifier for NullClassifier {
    fn name(&self) -> &str {
        "null"
    }

    fn predict(&self, _frame: &Frame) -> Result<Classification, InferenceError> {
        Ok(Classification::none())
    }
}

/// Parameters of a model file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Model family; only `luminance` is built in
    #[serde(default = "default_kind")]
    pub kind: String,

    /// Label reported for a detected defect
    #[serde(default = "default_label")]
    pub label: String,

    /// Pixels darker than this count as damaged
    #[serde(default = "default_dark_threshold")]
    pub dark_threshold: u8,

    /// Share of dark pixels at which the defect is reported with 0.5 confidence
    #[serde(default = "default_min_dark_ratio")]
    pub min_dark_ratio: f32,

    /// Frames are downscaled to this size before analysis
    #[serde(default)]
    pub input_size: Option<(u32, u32)>,
}

fn default_kind() -> String {
    "luminance".to_string()
}

fn default_label() -> String {
    "Defect".to_string()
}

fn default_dark_threshold() -> u8 {
    40
}

fn default_min_dark_ratio() -> f32 {
    0.02
}

impl Default for ModelDescriptor {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            label: default_label(),
            dark_threshold: default_dark_threshold(),
            min_dark_ratio: default_min_dark_ratio(),
            input_size: None,
        }
    }
}

impl ModelDescriptor {
    /// Read a descriptor; `.json` files are JSON, anything else TOML
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, InferenceError> {
        let path = path.as_ref();
        let load_error = |details: String| InferenceError::ModelLoad {
            path: path.display().to_string(),
            details,
        };

        let text = std::fs::read_to_string(path).map_err(|e| load_error(e.to_string()))?;
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let descriptor: ModelDescriptor = if is_json {
            serde_json::from_str(&text).map_err(|e| load_error(e.to_string()))?
        } else {
            toml::from_str(&text).map_err(|e| load_error(e.to_string()))?
        };

        descriptor.validate().map_err(load_error)?;
        Ok(descriptor)
    }

    fn validate(&self) -> Result<(), String> {
        if self.label.trim().is_empty() || self.label == NO_DEFECT_LABEL {
            return Err(format!("defect label '{}' is not usable", self.label));
        }
        if !(self.min_dark_ratio > 0.0 && self.min_dark_ratio <= 1.0) {
            return Err("min_dark_ratio must be in (0, 1]".to_string());
        }
        if let Some((w, h)) = self.input_size {
            if w == 0 || h == 0 {
                return Err("input_size must be positive".to_string());
            }
        }
        Ok(())
    }
}

/// Flags frames with a large share of very dark pixels (tears, holes, burns)
#[derive(Debug, Clone)]
pub struct LuminanceClassifier {
    descriptor: ModelDescriptor,
}

impl LuminanceClassifier {
    pub fn new(descriptor: ModelDescriptor) -> Self {
        Self { descriptor }
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }
}

impl Classifier for LuminanceClassifier {
    fn name(&self) -> &str {
        &self.descriptor.kind
    }

    fn predict(&self, frame: &Frame) -> Result<Classification, InferenceError> {
        let mut luma = frame.to_luma().map_err(|e| InferenceError::InvalidInput {
            details: e.to_string(),
        })?;
        if let Some((width, height)) = self.descriptor.input_size {
            if (luma.width(), luma.height()) != (width, height) {
                luma = imageops::resize(&luma, width, height, FilterType::Triangle);
            }
        }

        let total = luma.as_raw().len();
        if total == 0 {
            return Err(InferenceError::InvalidInput {
                details: format!("frame {} is empty", frame.sequence),
            });
        }

        let dark = luma
            .as_raw()
            .iter()
            .filter(|&&v| v < self.descriptor.dark_threshold)
            .count();
        let ratio = dark as f32 / total as f32;
        let min = self.descriptor.min_dark_ratio;

        let classification = if ratio >= min {
            Classification::new(self.descriptor.label.clone(), 0.5 + 0.5 * (ratio - min) / min)
        } else {
            Classification::new(NO_DEFECT_LABEL, 1.0 - ratio / min)
        };

        debug!(
            "Frame {}: {:.3} dark ratio -> {} ({:.2})",
            frame.sequence, ratio, classification.label, classification.confidence
        );
        Ok(classification)
    }
}

/// Build the classifier the configuration asks for
pub fn load_classifier(settings: &InferenceSettings) -> Result<Arc<dyn Classifier>, InferenceError> {
    if !settings.enabled {
        info!("Inference disabled, using null classifier");
        return Ok(Arc::new(NullClassifier));
    }

    let path = settings
        .model_path
        .as_deref()
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| InferenceError::ModelLoad {
            path: String::new(),
            details: "inference is enabled but no model path is configured".to_string(),
        })?;

    let descriptor = ModelDescriptor::load(path)?;
    match descriptor.kind.as_str() {
        "luminance" => {
            info!(
                "Loaded luminance model from {} (label '{}', dark < {}, ratio >= {})",
                path, descriptor.label, descriptor.dark_threshold, descriptor.min_dark_ratio
            );
            Ok(Arc::new(LuminanceClassifier::new(descriptor)))
        }
        other => Err(InferenceError::ModelLoad {
            path: path.to_string(),
            details: format!("unsupported model kind '{}'", other),
        }),
    }
}
