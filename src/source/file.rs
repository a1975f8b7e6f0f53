use super::core::{read_blocking, sleep_or_cancel, LoopContext, ReadOutcome, SourceCore};
use crate::error::CaptureError;
use crate::pacing::{FailureBackoff, FrameBudget, Pace};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Recorded footage replayed at its native rate, optionally looping
pub struct FileSource {
    pub(super) core: SourceCore,
}

impl FileSource {
    pub(super) fn new(core: SourceCore) -> Self {
        Self { core }
    }

    pub(super) fn start_capture(&mut self) -> bool {
        self.core.start_with(|context| tokio::spawn(playback_loop(context)))
    }

    /// Move the read position; the next delivered frame is `position`
    pub(super) fn seek(&mut self, position: u64) -> Result<(), CaptureError> {
        self.core.shared().seek(position)?;
        debug!("File seek to frame {}", position);
        Ok(())
    }
}

async fn playback_loop(context: LoopContext) {
    let shared = &context.shared;
    let fps = shared.backend_fps().unwrap_or_else(|| context.config.fps());
    let mut budget = FrameBudget::from_fps(fps);
    let mut backoff = FailureBackoff::new();
    let looping = context.config.loop_playback();
    let mut frames_since_rewind = 0u64;

    info!(
        "File playback running at {:.2} fps{}",
        fps,
        if looping { ", looping" } else { "" }
    );

    loop {
        if context.cancel.is_cancelled() {
            break;
        }
        let started = Instant::now();

        match read_blocking(shared).await {
            ReadOutcome::Frame(frame) => {
                backoff.on_success();
                frames_since_rewind += 1;
                if context.cancel.is_cancelled() {
                    break;
                }
                shared.deliver(frame);
            }
            ReadOutcome::EndOfStream if looping && frames_since_rewind > 0 => {
                debug!("End of file, rewinding");
                frames_since_rewind = 0;
                if let Err(e) = shared.seek(0) {
                    warn!("Failed to rewind file: {}", e);
                    shared.finish_playback();
                    break;
                }
                continue;
            }
            ReadOutcome::EndOfStream => {
                if !context.cancel.is_cancelled() {
                    shared.finish_playback();
                }
                break;
            }
            ReadOutcome::Failed(e) => {
                let delay = backoff.on_failure();
                warn!("File read failed, skipping frame: {}", e);
                if !sleep_or_cancel(&context.cancel, delay).await {
                    break;
                }
                continue;
            }
            ReadOutcome::Closed => break,
        }

        match budget.assess(started.elapsed()) {
            Pace::Wait(remaining) => {
                if !sleep_or_cancel(&context.cancel, remaining).await {
                    break;
                }
            }
            Pace::Late(overrun) => {
                shared.record_slow_frame(overrun);
                // Yield so cancellation and other tasks still make progress
                tokio::task::yield_now().await;
            }
        }
    }

    info!(
        "File playback loop exited ({} late frames, {} read failures)",
        budget.late_frames(),
        backoff.total()
    );
}
