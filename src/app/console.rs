use crate::events::{EventBus, InspectionEvent, OperatorCommand};
use crate::source::SourceKind;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use std::time::Duration;
use tokio::task::{self, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Amount `+` and `-` move the defect threshold
pub const THRESHOLD_STEP: f32 = 0.05;

/// Map a key to the operator command it stands for
pub fn key_command(code: KeyCode) -> Option<OperatorCommand> {
    let command = match code {
        KeyCode::Char('s') => OperatorCommand::StartCapture,
        KeyCode::Char('x') => OperatorCommand::StopCapture,
        KeyCode::Char('r') => OperatorCommand::ToggleRecording,
        KeyCode::Char('p') => OperatorCommand::Snapshot,
        KeyCode::Char('1') => OperatorCommand::Switch(SourceKind::HardwareCamera),
        KeyCode::Char('2') => OperatorCommand::Switch(SourceKind::NetworkCamera),
        KeyCode::Char('3') => OperatorCommand::Switch(SourceKind::File),
        KeyCode::Char('+') | KeyCode::Char('=') => OperatorCommand::AdjustThreshold(THRESHOLD_STEP),
        KeyCode::Char('-') => OperatorCommand::AdjustThreshold(-THRESHOLD_STEP),
        KeyCode::Char('q') | KeyCode::Esc => OperatorCommand::Quit,
        _ => return None,
    };
    Some(command)
}

/// Single-key operator console on the controlling terminal.
///
/// Keys are read in raw mode on a blocking thread and published as
/// [`InspectionEvent::OperatorCommand`]; the app loop applies them.
pub struct OperatorConsole {
    events: EventBus,
    cancellation_token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl OperatorConsole {
    pub fn new(events: EventBus) -> Self {
        Self {
            events,
            cancellation_token: CancellationToken::new(),
            task: None,
        }
    }

    /// Start reading keys
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        info!("Operator console: s start, x stop, r record, p snapshot, 1/2/3 source, +/- threshold, q quit");

        let events = self.events.clone();
        let cancellation_token = self.cancellation_token.clone();

        self.task = Some(task::spawn_blocking(move || {
            if let Err(e) = enable_raw_mode() {
                error!("Failed to enable raw mode for the operator console: {}", e);
                return;
            }
            debug!("Raw mode enabled");

            while !cancellation_token.is_cancelled() {
                match event::poll(Duration::from_millis(100)) {
                    Ok(true) => {
                        let Ok(Event::Key(key_event)) = event::read() else {
                            continue;
                        };
                        if key_event.kind != KeyEventKind::Press {
                            continue;
                        }
                        match key_command(key_event.code) {
                            Some(command) => {
                                debug!("Key {:?} -> {:?}", key_event.code, command);
                                events.publish(InspectionEvent::OperatorCommand { command });
                                if command == OperatorCommand::Quit {
                                    break;
                                }
                            }
                            None => debug!("Unbound key {:?}", key_event.code),
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!("Error polling for keyboard events: {}", e);
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            }

            if let Err(e) = disable_raw_mode() {
                error!("Failed to disable raw mode: {}", e);
            }
            debug!("Operator console exited");
        }));
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop reading keys and restore the terminal
    pub async fn stop(&mut self) {
        info!("Stopping operator console");
        self.cancellation_token.cancel();

        if let Some(task) = self.task.take() {
            if tokio::time::timeout(Duration::from_millis(500), task).await.is_err() {
                warn!("Operator console did not exit in time");
            }
        }

        // The blocking task may have failed before restoring the terminal
        let _ = disable_raw_mode();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_bindings() {
        assert_eq!(key_command(KeyCode::Char('s')), Some(OperatorCommand::StartCapture));
        assert_eq!(key_command(KeyCode::Char('x')), Some(OperatorCommand::StopCapture));
        assert_eq!(key_command(KeyCode::Char('r')), Some(OperatorCommand::ToggleRecording));
        assert_eq!(key_command(KeyCode::Char('p')), Some(OperatorCommand::Snapshot));
        assert_eq!(
            key_command(KeyCode::Char('3')),
            Some(OperatorCommand::Switch(SourceKind::File))
        );
        assert_eq!(
            key_command(KeyCode::Char('-')),
            Some(OperatorCommand::AdjustThreshold(-THRESHOLD_STEP))
        );
        assert_eq!(key_command(KeyCode::Esc), Some(OperatorCommand::Quit));
        assert_eq!(key_command(KeyCode::Char('z')), None);
        assert_eq!(key_command(KeyCode::Enter), None);
    }

    #[tokio::test]
    async fn test_console_stop_without_start() {
        let mut console = OperatorConsole::new(EventBus::new(16));
        assert!(!console.is_running());
        console.stop().await;
        assert!(console.cancellation_token.is_cancelled());
    }
}
