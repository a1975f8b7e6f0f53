use super::{InspectorApp, ShutdownReason};
use crate::error::{EventBusError, InspectorError, Result};
use crate::events::{EventFilter, InspectionEvent, OperatorCommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{oneshot, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

impl InspectorApp {
    /// Run the operator loop until a signal or quit request, then shut down
    pub async fn run(&mut self) -> Result<i32> {
        info!("Cardboard inspection is running");

        let shutdown_sender = self
            .shutdown_sender
            .take()
            .ok_or_else(|| InspectorError::system("Shutdown sender already taken"))?;
        let mut shutdown_receiver = self
            .shutdown_receiver
            .take()
            .ok_or_else(|| InspectorError::system("Shutdown receiver already taken"))?;

        self.setup_signal_handlers(shutdown_sender);

        let mut receiver = self.events.subscribe_filtered(
            EventFilter::EventTypes(vec![
                "operator_command",
                "defect_state_changed",
                "shutdown_requested",
            ]),
            "app",
        );

        let interval_secs = u64::from(self.config.system.status_interval_seconds.max(1));
        let mut status_tick = tokio::time::interval(Duration::from_secs(interval_secs));
        status_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        status_tick.tick().await;

        let mut signals_open = true;
        let reason = loop {
            tokio::select! {
                reason = &mut shutdown_receiver, if signals_open => match reason {
                    Ok(reason) => break reason,
                    Err(_) => {
                        warn!("Signal handlers exited; quit from the console instead");
                        signals_open = false;
                    }
                },
                event = receiver.recv() => match event {
                    Ok(event) => {
                        if let Some(reason) = self.handle_event(event).await {
                            break reason;
                        }
                    }
                    Err(EventBusError::Lagged { missed }) => {
                        warn!("Application loop missed {} events", missed);
                    }
                    Err(e) => {
                        error!("Event bus failed: {}", e);
                        break ShutdownReason::Error(e.to_string());
                    }
                },
                _ = status_tick.tick() => self.log_status(),
            }
        };

        info!("Shutdown initiated: {:?}", reason);
        let exit_code = self.shutdown(&reason).await?;

        info!("Cardboard inspection shutdown complete");
        Ok(exit_code)
    }

    /// React to one event; returns a reason when the app should stop
    pub async fn handle_event(&mut self, event: InspectionEvent) -> Option<ShutdownReason> {
        match event {
            InspectionEvent::OperatorCommand { command } => self.apply_command(command).await,
            InspectionEvent::DefectStateChanged { active } => {
                if let Some(controller) = self.controller.as_mut() {
                    controller.handle_defect(active);
                }
                None
            }
            InspectionEvent::ShutdownRequested { .. } => Some(ShutdownReason::UserRequest),
            _ => None,
        }
    }

    /// Apply an operator command to the controller
    pub async fn apply_command(&mut self, command: OperatorCommand) -> Option<ShutdownReason> {
        if command == OperatorCommand::Quit {
            return Some(ShutdownReason::UserRequest);
        }
        let Some(controller) = self.controller.as_mut() else {
            warn!("Ignoring {:?}, controller is shut down", command);
            return None;
        };

        match command {
            OperatorCommand::StartCapture => {
                controller.start_capture();
            }
            OperatorCommand::StopCapture => {
                controller.stop_capture().await;
            }
            OperatorCommand::ToggleRecording => {
                controller.toggle_recording();
            }
            OperatorCommand::Snapshot => {
                if let Err(e) = controller.capture_snapshot().await {
                    warn!("Snapshot failed: {}", e);
                }
            }
            OperatorCommand::Switch(kind) => {
                if kind == controller.kind() {
                    info!("{} is already the active source", kind);
                } else {
                    controller.switch_source(kind).await;
                }
            }
            OperatorCommand::AdjustThreshold(delta) => controller.adjust_threshold(delta),
            OperatorCommand::Quit => {}
        }
        None
    }

    fn log_status(&self) {
        info!("{}", self.status_line());
    }

    /// Forward SIGTERM and Ctrl+C into the shutdown channel
    fn setup_signal_handlers(&self, shutdown_sender: oneshot::Sender<ShutdownReason>) {
        let shutdown_sender = Arc::new(Mutex::new(Some(shutdown_sender)));

        #[cfg(unix)]
        {
            let shutdown_sender_sigterm = Arc::clone(&shutdown_sender);
            tokio::spawn(async move {
                let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(sigterm) => sigterm,
                    Err(e) => {
                        warn!("Failed to register SIGTERM handler: {}", e);
                        return;
                    }
                };
                if sigterm.recv().await.is_some() {
                    info!("Received SIGTERM signal");
                    if let Some(sender) = shutdown_sender_sigterm.lock().await.take() {
                        let _ = sender.send(ShutdownReason::Signal("SIGTERM".to_string()));
                    }
                }
            });
        }

        let shutdown_sender_sigint = Arc::clone(&shutdown_sender);
        tokio::spawn(async move {
            if let Ok(()) = signal::ctrl_c().await {
                info!("Received SIGINT signal (Ctrl+C)");
                if let Some(sender) = shutdown_sender_sigint.lock().await.take() {
                    let _ = sender.send(ShutdownReason::Signal("SIGINT".to_string()));
                }
            }
        });
    }
}
