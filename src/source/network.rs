use super::core::{read_blocking, reopen_blocking, sleep_or_cancel, LoopContext, ReadOutcome, SourceCore};
use crate::pacing::{FailureBackoff, FpsMeter, REPEATED_FAILURE_DELAY};
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

/// IP camera polled at its configured rate.
///
/// Ticks missed while a read or the frame handler runs long are dropped
/// rather than bursted.
pub struct NetworkCamera {
    pub(super) core: SourceCore,
}

impl NetworkCamera {
    pub(super) fn new(core: SourceCore) -> Self {
        Self { core }
    }

    pub(super) fn start_capture(&mut self) -> bool {
        self.core.start_with(|context| tokio::spawn(capture_loop(context)))
    }
}

async fn capture_loop(context: LoopContext) {
    let shared = &context.shared;
    let fps = shared.backend_fps().unwrap_or_else(|| context.config.fps());
    let period = Duration::from_secs_f64(1.0 / fps.clamp(0.1, 1000.0));

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut meter = FpsMeter::new();
    let mut backoff = FailureBackoff::new();

    info!("Network capture loop running at {:.1} fps", fps);

    loop {
        tokio::select! {
            biased;
            _ = context.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match read_blocking(shared).await {
            ReadOutcome::Frame(frame) => {
                backoff.on_success();
                let now = Instant::now();
                meter.record(now);
                shared.set_measured_fps(meter.fps(now));

                if context.cancel.is_cancelled() {
                    break;
                }
                shared.deliver(frame);
            }
            ReadOutcome::EndOfStream => {
                warn!("Network stream ended, reconnecting");
                reopen(&context).await;
                if !sleep_or_cancel(&context.cancel, REPEATED_FAILURE_DELAY).await {
                    break;
                }
            }
            ReadOutcome::Failed(e) => {
                let delay = backoff.on_failure();
                warn!(
                    "Network stream read failed ({} in a row): {}",
                    backoff.consecutive(),
                    e
                );
                if backoff.watchdog_due() && reopen(&context).await {
                    backoff.on_success();
                }
                if !sleep_or_cancel(&context.cancel, delay).await {
                    break;
                }
            }
            ReadOutcome::Closed => break,
        }
    }

    shared.set_measured_fps(0.0);
    info!("Network capture loop exited ({} read failures)", backoff.total());
}

async fn reopen(context: &LoopContext) -> bool {
    match reopen_blocking(context).await {
        Ok(()) => true,
        Err(e) => {
            error!("Failed to reopen network stream: {}", e);
            false
        }
    }
}
