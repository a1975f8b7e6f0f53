use crate::frame::Frame;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Work executed on the display context
pub type DisplayJob = Box<dyn FnOnce(&mut DisplayState) + Send>;

/// Runs closures on the display context, in the order they were posted
pub trait DisplayMarshal: Send + Sync {
    /// Queue `job`; false if the display context is gone
    fn post(&self, job: DisplayJob) -> bool;
}

/// What the operator currently sees
#[derive(Debug, Clone, Default)]
pub struct DisplayState {
    pub current_frame: Option<Frame>,
    pub frames_displayed: u64,
    pub last_frame_at: Option<SystemTime>,
}

impl DisplayState {
    /// Replace the shown frame and count it
    pub fn show(&mut self, frame: Frame) {
        self.last_frame_at = Some(frame.timestamp);
        self.current_frame = Some(frame);
        self.frames_displayed += 1;
    }

    pub fn clear(&mut self) {
        *self = DisplayState::default();
    }
}

/// Default display context: one task draining an ordered job queue
pub struct DisplayContext {
    sender: mpsc::UnboundedSender<DisplayJob>,
    state: Arc<RwLock<DisplayState>>,
    task: JoinHandle<()>,
}

impl DisplayContext {
    /// Start the display task on the current runtime
    pub fn spawn() -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<DisplayJob>();
        let state = Arc::new(RwLock::new(DisplayState::default()));
        let task_state = Arc::clone(&state);

        let task = tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                job(&mut task_state.write());
            }
            debug!("Display context drained");
        });

        Self {
            sender,
            state,
            task,
        }
    }

    /// Snapshot of the display state as of the last completed job
    pub fn state(&self) -> DisplayState {
        self.state.read().clone()
    }

    /// Wait until every job posted so far has run
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        let posted = self.post(Box::new(move |_state| {
            let _ = done.send(());
        }));
        if posted {
            let _ = wait.await;
        }
    }

    /// Stop accepting jobs and wait for the queue to drain
    pub async fn shutdown(self) {
        let Self { sender, task, .. } = self;
        drop(sender);
        let _ = task.await;
    }
}

impl DisplayMarshal for DisplayContext {
    fn post(&self, job: DisplayJob) -> bool {
        let posted = self.sender.send(job).is_ok();
        if !posted {
            trace!("Display context closed, dropping job");
        }
        posted
    }
}

impl<M: DisplayMarshal + ?Sized> DisplayMarshal for Arc<M> {
    fn post(&self, job: DisplayJob) -> bool {
        (**self).post(job)
    }
}
