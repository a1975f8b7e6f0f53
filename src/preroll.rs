use crate::error::{InspectorError, Result};
use crate::frame::Frame;
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Bounded FIFO holding the most recent frames so a recording can start
/// with footage that precedes its trigger.
///
/// Not internally synchronised: the owning frame source keeps it behind the
/// same lock that guards its device handle.
#[derive(Debug)]
pub struct PrerollBuffer {
    frames: VecDeque<Frame>,
    capacity: usize,
}

/// Buffer capacity for `seconds` of footage at `fps`, never less than one frame
pub fn capacity_for(seconds: u32, fps: f64) -> usize {
    let frames = (seconds as f64 * fps).round();
    if frames.is_finite() && frames >= 1.0 {
        frames as usize
    } else {
        1
    }
}

impl PrerollBuffer {
    /// Create a buffer holding at most `capacity` frames
    ///
    /// # Example
    /// ```
    /// use cardboard_inspect::preroll::PrerollBuffer;
    ///
    /// let buffer = PrerollBuffer::new(150).unwrap();
    /// assert_eq!(buffer.capacity(), 150);
    /// ```
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(InspectorError::system(
                "Pre-roll buffer capacity must be greater than 0",
            ));
        }

        debug!("Created pre-roll buffer with capacity {}", capacity);

        Ok(Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    /// Push a frame, evicting the oldest one when the buffer is full
    pub fn push(&mut self, frame: Frame) {
        while self.frames.len() >= self.capacity {
            if let Some(evicted) = self.frames.pop_front() {
                trace!("Evicted frame {} from pre-roll", evicted.sequence);
            }
        }
        self.frames.push_back(frame);
    }

    /// Copies of the buffered frames, oldest first
    pub fn snapshot(&self) -> Vec<Frame> {
        self.frames.iter().cloned().collect()
    }

    /// Drop every buffered frame
    pub fn clear(&mut self) {
        if !self.frames.is_empty() {
            debug!("Clearing {} pre-roll frames", self.frames.len());
        }
        self.frames.clear();
    }

    /// Change capacity, evicting the oldest frames if the buffer shrinks
    pub fn resize(&mut self, capacity: usize) {
        let capacity = capacity.max(1);
        while self.frames.len() > capacity {
            self.frames.pop_front();
        }
        if capacity != self.capacity {
            debug!("Pre-roll capacity {} -> {}", self.capacity, capacity);
        }
        self.capacity = capacity;
    }

    pub fn latest(&self) -> Option<&Frame> {
        self.frames.back()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
