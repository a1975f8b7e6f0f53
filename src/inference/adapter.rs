use super::{Classification, Classifier, Prediction};
use crate::error::{InspectorError, Result};
use crate::frame::Frame;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// Counters for the inference path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InferenceStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    /// Frames dropped because too many jobs were in flight
    pub skipped: u64,
    /// Results discarded because a newer one had already landed
    pub stale: u64,
    pub in_flight: usize,
}

struct AdapterShared {
    classifier: Arc<dyn Classifier>,
    slot: watch::Sender<Prediction>,
    in_flight: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    stale: AtomicU64,
}

impl AdapterShared {
    fn run(&self, frame: Frame, sequence: u64) {
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.classifier.predict(&frame)));
        let classification = match outcome {
            Ok(Ok(classification)) => classification,
            Ok(Err(e)) => {
                warn!("Inference failed for frame {}: {}", frame.sequence, e);
                self.failed.fetch_add(1, Ordering::Relaxed);
                Classification::none()
            }
            Err(_) => {
                warn!("Classifier panicked on frame {}", frame.sequence);
                self.failed.fetch_add(1, Ordering::Relaxed);
                Classification::none()
            }
        };
        trace!(
            "Inference for frame {} took {:?}",
            frame.sequence,
            started.elapsed()
        );

        self.offer(Prediction::from_classification(classification, sequence, frame.sequence));
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Publish `prediction` unless a newer one is already current
    fn offer(&self, prediction: Prediction) -> bool {
        let mut rejected = None;
        let accepted = self.slot.send_if_modified(|current| {
            if prediction.sequence > current.sequence {
                *current = prediction.clone();
                true
            } else {
                rejected = Some(current.sequence);
                false
            }
        });
        if let Some(current) = rejected {
            debug!(
                "Discarding stale prediction {} (current {})",
                prediction.sequence, current
            );
            self.stale.fetch_add(1, Ordering::Relaxed);
        }
        accepted
    }
}

/// Runs the classifier off the capture path and keeps the newest result.
///
/// `submit` never blocks: it hands the frame to the runtime's blocking pool
/// and returns. Results may complete in any order; a monotonic submission
/// sequence keeps an older result from replacing a newer one.
pub struct InferenceAdapter {
    shared: Arc<AdapterShared>,
    runtime: Handle,
    next_sequence: AtomicU64,
    submitted: AtomicU64,
    skipped: AtomicU64,
    max_in_flight: usize,
}

impl InferenceAdapter {
    /// Adapter bound to the current tokio runtime
    pub fn new(classifier: Arc<dyn Classifier>, max_in_flight: usize) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            InspectorError::component("inference", format!("No tokio runtime available: {}", e))
        })?;
        Ok(Self::with_handle(classifier, max_in_flight, runtime))
    }

    /// Adapter bound to an explicit runtime, callable from any thread
    pub fn with_handle(classifier: Arc<dyn Classifier>, max_in_flight: usize, runtime: Handle) -> Self {
        let (slot, _) = watch::channel(Prediction::empty(0));
        debug!(
            "Inference adapter using '{}' with up to {} jobs in flight",
            classifier.name(),
            max_in_flight.max(1)
        );
        Self {
            shared: Arc::new(AdapterShared {
                classifier,
                slot,
                in_flight: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                stale: AtomicU64::new(0),
            }),
            runtime,
            next_sequence: AtomicU64::new(1),
            submitted: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Queue `frame` for classification.
    ///
    /// Returns the submission sequence, or None when the frame was skipped
    /// because `max_in_flight` jobs are already running.
    pub fn submit(&self, frame: Frame) -> Option<u64> {
        let admitted = self
            .shared
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_in_flight).then_some(n + 1)
            })
            .is_ok();
        if !admitted {
            let skipped = self.skipped.fetch_add(1, Ordering::Relaxed) + 1;
            if skipped == 1 || skipped % 100 == 0 {
                debug!("Inference saturated, {} frames skipped", skipped);
            }
            return None;
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::AcqRel);
        self.submitted.fetch_add(1, Ordering::Relaxed);

        let shared = Arc::clone(&self.shared);
        // Completion is observed through the slot, not the join handle
        let _ = self.runtime.spawn_blocking(move || {
            shared.run(frame, sequence);
            shared.in_flight.fetch_sub(1, Ordering::AcqRel);
        });

        Some(sequence)
    }

    /// Most recently completed prediction
    pub fn current(&self) -> Prediction {
        self.shared.slot.borrow().clone()
    }

    /// Receiver notified whenever a newer prediction lands
    pub fn subscribe(&self) -> watch::Receiver<Prediction> {
        self.shared.slot.subscribe()
    }

    /// Clear the prediction; results for earlier submissions are discarded
    pub fn reset(&self) {
        let floor = self.next_sequence.load(Ordering::Acquire).saturating_sub(1);
        self.shared.slot.send_replace(Prediction::empty(floor));
        debug!("Prediction reset at submission {}", floor);
    }

    /// Wait until no jobs are in flight or `timeout` passes; returns true when idle
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.shared.in_flight.load(Ordering::Acquire) > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }

    pub fn classifier_name(&self) -> &str {
        self.shared.classifier.name()
    }

    pub fn stats(&self) -> InferenceStats {
        InferenceStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.shared.completed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            stale: self.shared.stale.load(Ordering::Relaxed),
            in_flight: self.shared.in_flight.load(Ordering::Relaxed),
        }
    }
}
