//! Rate-control helpers shared by the capture loops.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Delay applied once a read has failed more than once in a row
pub const REPEATED_FAILURE_DELAY: Duration = Duration::from_secs(1);

/// Consecutive read failures after which a live backend is reopened
pub const WATCHDOG_FAILURE_THRESHOLD: u32 = 5;

/// Outcome of checking a frame's processing time against its budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pace {
    /// Sleep this long before emitting the next frame
    Wait(Duration),
    /// Processing overran the budget by this much; emit the next frame now
    Late(Duration),
}

/// Per-frame time budget for fixed-rate playback.
///
/// Each frame is judged on its own: an overrun never shortens the budget of
/// the frames after it, so drift does not accumulate.
#[derive(Debug, Clone)]
pub struct FrameBudget {
    budget: Duration,
    late_frames: u64,
}

impl FrameBudget {
    pub fn from_fps(fps: f64) -> Self {
        let fps = if fps.is_finite() && fps > 0.0 { fps } else { 30.0 };
        Self {
            budget: Duration::from_secs_f64(1.0 / fps),
            late_frames: 0,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Judge a frame that took `elapsed` to read and deliver
    pub fn assess(&mut self, elapsed: Duration) -> Pace {
        if elapsed <= self.budget {
            Pace::Wait(self.budget - elapsed)
        } else {
            self.late_frames += 1;
            Pace::Late(elapsed - self.budget)
        }
    }

    pub fn late_frames(&self) -> u64 {
        self.late_frames
    }
}

/// Delivered-frame rate over a sliding one second window
#[derive(Debug, Clone)]
pub struct FpsMeter {
    window: Duration,
    instants: VecDeque<Instant>,
}

impl Default for FpsMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl FpsMeter {
    pub fn new() -> Self {
        Self {
            window: Duration::from_secs(1),
            instants: VecDeque::new(),
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.instants.push_back(now);
        self.expire(now);
    }

    /// Frames per second observed within the window ending at `now`
    pub fn fps(&mut self, now: Instant) -> f64 {
        self.expire(now);
        self.instants.len() as f64 / self.window.as_secs_f64()
    }

    pub fn reset(&mut self) {
        self.instants.clear();
    }

    fn expire(&mut self, now: Instant) {
        while let Some(oldest) = self.instants.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                self.instants.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Retry delay for transient read failures: a single bad frame is skipped
/// immediately, repeated failures back off.
#[derive(Debug, Clone, Default)]
pub struct FailureBackoff {
    consecutive: u32,
    total: u64,
}

impl FailureBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and return how long to wait before the next read
    pub fn on_failure(&mut self) -> Duration {
        self.consecutive = self.consecutive.saturating_add(1);
        self.total += 1;
        if self.consecutive <= 1 {
            Duration::ZERO
        } else {
            REPEATED_FAILURE_DELAY
        }
    }

    pub fn on_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// True once enough failures have piled up that the handle should be reopened
    pub fn watchdog_due(&self) -> bool {
        self.consecutive >= WATCHDOG_FAILURE_THRESHOLD
    }
}
