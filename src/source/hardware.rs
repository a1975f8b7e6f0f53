use super::core::{sleep_blocking, LoopContext, ReadOutcome, SourceCore};
use crate::pacing::{FailureBackoff, FpsMeter, REPEATED_FAILURE_DELAY};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Industrial camera delivering frames at the device's own rate.
///
/// Grabs block inside the driver, so the loop runs on the blocking pool and
/// never sleeps between successful reads.
pub struct HardwareCamera {
    pub(super) core: SourceCore,
}

impl HardwareCamera {
    pub(super) fn new(core: SourceCore) -> Self {
        Self { core }
    }

    pub(super) fn start_capture(&mut self) -> bool {
        self.core
            .start_with(|context| tokio::task::spawn_blocking(move || capture_loop(context)))
    }
}

fn capture_loop(context: LoopContext) {
    let shared = &context.shared;
    let mut meter = FpsMeter::new();
    let mut backoff = FailureBackoff::new();
    let mut last_report = Instant::now();

    info!("Hardware capture loop running");

    while !context.cancel.is_cancelled() {
        match shared.read_next() {
            ReadOutcome::Frame(frame) => {
                backoff.on_success();
                let now = Instant::now();
                meter.record(now);

                if now.duration_since(last_report).as_secs() >= 1 {
                    let fps = meter.fps(now);
                    shared.set_measured_fps(fps);
                    debug!("Hardware camera delivering {:.1} fps", fps);
                    last_report = now;
                }

                if context.cancel.is_cancelled() {
                    break;
                }
                shared.deliver(frame);
            }
            ReadOutcome::EndOfStream => {
                warn!("Hardware camera reported end of stream");
                sleep_blocking(&context.cancel, REPEATED_FAILURE_DELAY);
            }
            ReadOutcome::Failed(e) => {
                let delay = backoff.on_failure();
                warn!(
                    "Hardware camera read failed ({} in a row): {}",
                    backoff.consecutive(),
                    e
                );

                if backoff.watchdog_due() {
                    warn!("Hardware camera unresponsive, reopening device");
                    match shared.reopen(
                        context.opener.as_ref(),
                        &context.config,
                        context.path_override.as_deref(),
                    ) {
                        Ok(()) => {
                            backoff.on_success();
                            meter.reset();
                        }
                        Err(e) => error!("Failed to reopen hardware camera: {}", e),
                    }
                }

                sleep_blocking(&context.cancel, delay);
            }
            ReadOutcome::Closed => break,
        }
    }

    shared.set_measured_fps(0.0);
    info!(
        "Hardware capture loop exited ({} read failures)",
        backoff.total()
    );
}
