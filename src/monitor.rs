//! Alert monitor: surfaces run transitions and machine faults as events.
//!
//! The monitor runs in its own task, watching the runner's status channel
//! and polling the controller for machine-reported faults. Everything it
//! notices is published as a typed [`AlertEvent`] on a bounded channel the
//! front end drains; when the consumer falls behind, older alerts are
//! dropped rather than stalling the monitor, since a stale alert is worth
//! less than a current one.

use crate::config::MonitorConfig;
use crate::controller::ControllerHandle;
use crate::runner::RunStatus;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Something the operator should know about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AlertEvent {
    /// The run moved between lifecycle states.
    StatusChanged { from: RunStatus, to: RunStatus },
    /// A run ended in `Faulted`.
    RunFaulted,
    /// The controller reported a machine fault.
    ControllerFault { message: String },
    /// A status poll failed; the machine state is unknown.
    StatusUnavailable { message: String },
}

/// Handle to the monitor task. Dropping it stops the monitor.
pub struct AlertMonitor {
    stop: watch::Sender<bool>,
}

impl AlertMonitor {
    /// Spawns the monitor and returns its handle and the alert stream.
    pub fn spawn(
        status: watch::Receiver<RunStatus>,
        controller: ControllerHandle,
        config: MonitorConfig,
    ) -> (Self, mpsc::Receiver<AlertEvent>) {
        let (alerts_tx, alerts_rx) = mpsc::channel(config.alert_capacity.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(monitor_loop(status, controller, config, alerts_tx, stop_rx));
        (Self { stop: stop_tx }, alerts_rx)
    }

    /// Stops the monitor task. Safe to call more than once.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

async fn monitor_loop(
    mut status: watch::Receiver<RunStatus>,
    controller: ControllerHandle,
    config: MonitorConfig,
    alerts: mpsc::Sender<AlertEvent>,
    mut stop: watch::Receiver<bool>,
) {
    let mut poll = tokio::time::interval(config.poll_interval);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_status = *status.borrow();
    // Faults repeat on every poll until cleared; report each message once.
    let mut reported_fault: Option<String> = None;

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    // Runner is gone; nothing left to watch.
                    break;
                }
                let current = *status.borrow_and_update();
                if current == last_status {
                    continue;
                }
                publish(&alerts, AlertEvent::StatusChanged {
                    from: last_status,
                    to: current,
                });
                if current == RunStatus::Faulted {
                    publish(&alerts, AlertEvent::RunFaulted);
                }
                last_status = current;
            }
            _ = poll.tick() => {
                match controller.status().await {
                    Ok(machine) => match machine.fault {
                        Some(message) => {
                            if reported_fault.as_deref() != Some(message.as_str()) {
                                publish(&alerts, AlertEvent::ControllerFault {
                                    message: message.clone(),
                                });
                                reported_fault = Some(message);
                            }
                        }
                        None => reported_fault = None,
                    },
                    Err(err) => {
                        let message = err.to_string();
                        if reported_fault.as_deref() != Some(message.as_str()) {
                            publish(&alerts, AlertEvent::StatusUnavailable {
                                message: message.clone(),
                            });
                            reported_fault = Some(message);
                        }
                    }
                }
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
        }
    }
    debug!("alert monitor stopped");
}

fn publish(alerts: &mpsc::Sender<AlertEvent>, event: AlertEvent) {
    if let Err(mpsc::error::TrySendError::Full(event)) = alerts.try_send(event) {
        warn!(?event, "alert buffer full, dropping alert");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{MockController, MotionController};
    use std::sync::Arc;
    use std::time::Duration;

    fn config() -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_millis(5),
            alert_capacity: 8,
        }
    }

    #[tokio::test]
    async fn reports_status_transitions() {
        let ctl: ControllerHandle = Arc::new(MockController::new());
        let (status_tx, status_rx) = watch::channel(RunStatus::Idle);
        let (_monitor, mut alerts) = AlertMonitor::spawn(status_rx, ctl, config());

        status_tx.send(RunStatus::Running).unwrap();
        assert_eq!(
            alerts.recv().await,
            Some(AlertEvent::StatusChanged {
                from: RunStatus::Idle,
                to: RunStatus::Running,
            })
        );
    }

    #[tokio::test]
    async fn faulted_run_raises_a_dedicated_alert() {
        let ctl: ControllerHandle = Arc::new(MockController::new());
        let (status_tx, status_rx) = watch::channel(RunStatus::Running);
        let (_monitor, mut alerts) = AlertMonitor::spawn(status_rx, ctl, config());

        status_tx.send(RunStatus::Faulted).unwrap();
        assert_eq!(
            alerts.recv().await,
            Some(AlertEvent::StatusChanged {
                from: RunStatus::Running,
                to: RunStatus::Faulted,
            })
        );
        assert_eq!(alerts.recv().await, Some(AlertEvent::RunFaulted));
    }

    #[tokio::test]
    async fn machine_fault_is_reported_once_per_message() {
        let ctl = Arc::new(MockController::new());
        let (_status_tx, status_rx) = watch::channel(RunStatus::Idle);
        let (_monitor, mut alerts) =
            AlertMonitor::spawn(status_rx, ctl.clone(), config());

        ctl.emergency_stop();
        let event = alerts.recv().await.unwrap();
        assert!(matches!(event, AlertEvent::ControllerFault { .. }));

        // Fault persists across polls but is not re-reported.
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(alerts.try_recv().is_err());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let ctl: ControllerHandle = Arc::new(MockController::new());
        let (_status_tx, status_rx) = watch::channel(RunStatus::Idle);
        let (monitor, _alerts) = AlertMonitor::spawn(status_rx, ctl, config());
        monitor.stop();
        monitor.stop();
    }
}
