use super::*;
use crate::config::InferenceSettings;
use crate::error::InferenceError;
use crate::frame::{Frame, PixelFormat};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

fn gray_frame(sequence: u64, pixels: Vec<u8>, width: u32, height: u32) -> Frame {
    Frame::new(sequence, SystemTime::now(), pixels, width, height, PixelFormat::Mono8)
}

/// Answers after a per-frame delay, labelling each frame with its sequence
struct DelayedClassifier {
    slow_frame: u64,
    delay: Duration,
}

impl Classifier for DelayedClassifier {
    fn name(&self) -> &str {
        "delayed"
    }

    fn predict(&self, frame: &Frame) -> Result<Classification, InferenceError> {
        if frame.sequence == self.slow_frame {
            std::thread::sleep(self.delay);
        }
        Ok(Classification::new(format!("frame-{}", frame.sequence), 0.9))
    }
}

struct FailingClassifier;

impl Classifier for FailingClassifier {
    fn name(&self) -> &str {
        "failing"
    }

    fn predict(&self, _frame: &Frame) -> Result<Classification, InferenceError> {
        Err(InferenceError::Prediction {
            details: "model crashed".to_string(),
        })
    }
}

#[test]
fn test_defect_requires_label_and_threshold() {
    let mut prediction = Prediction::empty(1);
    prediction.confidence = 0.99;
    assert!(!prediction.is_defect(0.5));

    prediction.label = "Tear".to_string();
    prediction.confidence = 0.5;
    assert!(prediction.is_defect(0.5));
    assert!(!prediction.is_defect(0.51));
}

#[test]
fn test_classification_clamps_confidence() {
    assert_eq!(Classification::new("x", 1.7).confidence, 1.0);
    assert_eq!(Classification::new("x", -0.2).confidence, 0.0);
    assert_eq!(Classification::new("x", f32::NAN).confidence, 0.0);
    assert_eq!(Classification::none().label, NO_DEFECT_LABEL);
}

#[test]
fn test_luminance_classifier() {
    let classifier = LuminanceClassifier::new(ModelDescriptor {
        label: "Hole".to_string(),
        dark_threshold: 40,
        min_dark_ratio: 0.1,
        ..ModelDescriptor::default()
    });

    let clean = gray_frame(1, vec![200; 100], 10, 10);
    let result = classifier.predict(&clean).unwrap();
    assert_eq!(result.label, NO_DEFECT_LABEL);
    assert_eq!(result.confidence, 1.0);

    let mut pixels = vec![200; 100];
    pixels[..20].iter_mut().for_each(|p| *p = 10);
    let damaged = gray_frame(2, pixels, 10, 10);
    let result = classifier.predict(&damaged).unwrap();
    assert_eq!(result.label, "Hole");
    assert!((result.confidence - 1.0).abs() < 1e-6);

    let released = gray_frame(3, Vec::new(), 10, 10);
    assert!(matches!(
        classifier.predict(&released),
        Err(InferenceError::InvalidInput { .. })
    ));
}

#[test]
fn test_model_descriptor_formats() {
    let temp_dir = TempDir::new().unwrap();

    let toml_path = temp_dir.path().join("model.toml");
    std::fs::write(&toml_path, "label = \"Crush\"\ndark_threshold = 30\n").unwrap();
    let descriptor = ModelDescriptor::load(&toml_path).unwrap();
    assert_eq!(descriptor.label, "Crush");
    assert_eq!(descriptor.dark_threshold, 30);
    assert_eq!(descriptor.min_dark_ratio, 0.02);

    let json_path = temp_dir.path().join("model.json");
    std::fs::write(&json_path, r#"{"label": "Stain", "input_size": [32, 32]}"#).unwrap();
    let descriptor = ModelDescriptor::load(&json_path).unwrap();
    assert_eq!(descriptor.input_size, Some((32, 32)));

    let bad_path = temp_dir.path().join("bad.toml");
    std::fs::write(&bad_path, "label = \"None\"\n").unwrap();
    assert!(matches!(
        ModelDescriptor::load(&bad_path),
        Err(InferenceError::ModelLoad { .. })
    ));
}

#[test]
fn test_load_classifier_from_settings() {
    let temp_dir = TempDir::new().unwrap();
    let mut settings = InferenceSettings {
        enabled: false,
        model_path: None,
        confidence_threshold: 0.5,
        max_in_flight: 2,
    };
    assert_eq!(load_classifier(&settings).unwrap().name(), "null");

    settings.enabled = true;
    assert!(load_classifier(&settings).is_err());

    let path = temp_dir.path().join("model.toml");
    std::fs::write(&path, "kind = \"luminance\"\n").unwrap();
    settings.model_path = Some(path.display().to_string());
    assert_eq!(load_classifier(&settings).unwrap().name(), "luminance");

    std::fs::write(&path, "kind = \"resnet\"\n").unwrap();
    assert!(load_classifier(&settings).is_err());
}

#[tokio::test]
async fn test_slow_older_result_never_overwrites_newer() {
    let adapter = InferenceAdapter::new(
        Arc::new(DelayedClassifier {
            slow_frame: 3,
            delay: Duration::from_millis(150),
        }),
        8,
    )
    .unwrap();

    for sequence in 1..=5 {
        assert!(adapter.submit(gray_frame(sequence, vec![0; 4], 2, 2)).is_some());
    }
    assert!(adapter.wait_idle(Duration::from_secs(5)).await);

    let current = adapter.current();
    assert_eq!(current.label, "frame-5");
    assert_eq!(current.sequence, 5);
    assert_eq!(current.frame_sequence, Some(5));

    let stats = adapter.stats();
    assert_eq!(stats.completed, 5);
    assert!(stats.stale >= 1);
}

#[tokio::test]
async fn test_failures_yield_no_defect() {
    let adapter = InferenceAdapter::new(Arc::new(FailingClassifier), 2).unwrap();
    let mut receiver = adapter.subscribe();

    adapter.submit(gray_frame(7, vec![0; 4], 2, 2));
    tokio::time::timeout(Duration::from_secs(5), receiver.changed())
        .await
        .unwrap()
        .unwrap();

    let prediction = receiver.borrow().clone();
    assert_eq!(prediction.label, NO_DEFECT_LABEL);
    assert_eq!(prediction.confidence, 0.0);
    assert_eq!(adapter.stats().failed, 1);
}

#[tokio::test]
async fn test_saturated_adapter_skips_frames() {
    let adapter = InferenceAdapter::new(
        Arc::new(DelayedClassifier {
            slow_frame: 1,
            delay: Duration::from_millis(200),
        }),
        1,
    )
    .unwrap();

    assert_eq!(adapter.submit(gray_frame(1, vec![0; 4], 2, 2)), Some(1));
    assert_eq!(adapter.submit(gray_frame(2, vec![0; 4], 2, 2)), None);
    assert_eq!(adapter.stats().skipped, 1);

    assert!(adapter.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(adapter.submit(gray_frame(3, vec![0; 4], 2, 2)), Some(2));
    assert!(adapter.wait_idle(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_reset_discards_in_flight_results() {
    let adapter = InferenceAdapter::new(
        Arc::new(DelayedClassifier {
            slow_frame: 1,
            delay: Duration::from_millis(100),
        }),
        4,
    )
    .unwrap();

    adapter.submit(gray_frame(1, vec![0; 4], 2, 2));
    adapter.reset();
    assert!(adapter.wait_idle(Duration::from_secs(5)).await);

    let current = adapter.current();
    assert_eq!(current.label, NO_DEFECT_LABEL);
    assert_eq!(current.frame_sequence, None);

    adapter.submit(gray_frame(2, vec![0; 4], 2, 2));
    assert!(adapter.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(adapter.current().label, "frame-2");
}

#[test]
fn test_submit_from_a_plain_thread() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let adapter = Arc::new(InferenceAdapter::with_handle(
        Arc::new(NullClassifier),
        2,
        runtime.handle().clone(),
    ));

    let worker_adapter = Arc::clone(&adapter);
    std::thread::spawn(move || worker_adapter.submit(gray_frame(1, vec![0; 4], 2, 2)))
        .join()
        .unwrap();

    assert!(runtime.block_on(adapter.wait_idle(Duration::from_secs(5))));
    assert_eq!(adapter.current().sequence, 1);
}
