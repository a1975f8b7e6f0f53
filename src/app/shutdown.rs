use super::{ComponentState, InspectorApp, ShutdownReason};
use crate::events::InspectionEvent;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::timeout;
use tracing::{error, info, warn};

const CONTROLLER_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const DISPLAY_STOP_TIMEOUT: Duration = Duration::from_secs(5);

impl InspectorApp {
    /// Stop components in reverse start order; returns the process exit code
    pub async fn shutdown(&mut self, reason: &ShutdownReason) -> crate::error::Result<i32> {
        info!("Beginning graceful shutdown");
        self.cancellation_token.cancel();
        self.events.publish(InspectionEvent::ShutdownRequested {
            timestamp: SystemTime::now(),
            reason: format!("{:?}", reason),
        });

        let mut exit_code = match reason {
            ShutdownReason::Error(_) => 1,
            _ => 0,
        };

        if let Some(mut console) = self.console.take() {
            if self.console_enabled {
                self.set_component_state("console", ComponentState::Stopping);
            }
            console.stop().await;
            if self.console_enabled {
                self.set_component_state("console", ComponentState::Stopped);
            }
        }

        if !self.stop_controller().await {
            exit_code = 1;
        }

        if !self.stop_display().await {
            exit_code = 1;
        }

        let stats = self.inference.stats();
        info!(
            "Inference: {} submitted, {} completed, {} failed, {} skipped",
            stats.submitted, stats.completed, stats.failed, stats.skipped
        );
        self.set_component_state("inference", ComponentState::Stopped);

        info!("Graceful shutdown completed with exit code: {}", exit_code);
        Ok(exit_code)
    }

    /// Stop capture and recording and release the source
    async fn stop_controller(&mut self) -> bool {
        let Some(controller) = self.controller.take() else {
            return true;
        };
        info!("Stopping controller component");
        self.set_component_state("controller", ComponentState::Stopping);

        if timeout(CONTROLLER_STOP_TIMEOUT, controller.shutdown())
            .await
            .is_err()
        {
            error!("Controller component stop timeout");
            self.set_component_state("controller", ComponentState::Failed);
            return false;
        }

        self.set_component_state("controller", ComponentState::Stopped);
        info!("Controller component stopped");
        true
    }

    /// Drain the display queue once every frame handler is gone
    async fn stop_display(&mut self) -> bool {
        let Some(display) = self.display.take() else {
            return true;
        };
        self.set_component_state("display", ComponentState::Stopping);

        let stopped = match Arc::try_unwrap(display) {
            Ok(display) => timeout(DISPLAY_STOP_TIMEOUT, display.shutdown())
                .await
                .is_ok(),
            Err(display) => {
                warn!("Display context still shared at shutdown, flushing only");
                timeout(DISPLAY_STOP_TIMEOUT, display.flush()).await.is_ok()
            }
        };

        if stopped {
            self.set_component_state("display", ComponentState::Stopped);
        } else {
            error!("Display component stop timeout");
            self.set_component_state("display", ComponentState::Failed);
        }
        stopped
    }
}
