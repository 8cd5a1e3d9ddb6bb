//! Protocol runner: executes a program as a supervised state machine.
//!
//! A program is an ordered list of [`Operation`]s. The runner owns the
//! dispatcher and executes exactly one program at a time inside its own
//! task; callers interact through a cloneable [`RunnerHandle`] that sends
//! control messages over a bounded channel and observes status through a
//! watch channel.
//!
//! Pause, resume, and cancel all take effect at operation boundaries: the
//! operation in flight always runs to completion first, so the machine is
//! never left mid-aspirate. Emergency stop is the one exception; it goes
//! straight to the controller out-of-band and the run surfaces as `Faulted`
//! at the next boundary.

use crate::controller::{ControllerHandle, LimitKind};
use crate::dispatch::{Dispatcher, HomeTarget};
use crate::error::{AppResult, PipetteError};
use crate::persist::DeckSnapshot;
use crate::resources::Coordinate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{error, info, warn};

/// One step of a protocol program.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Home axes, the pipette toolhead, or both.
    Home { target: HomeTarget },
    /// Adjust a machine limit for the rest of the run.
    SetLimit { kind: LimitKind, value: f64 },
    /// Move to an absolute position.
    MoveAbsolute { x: f64, y: f64, z: f64 },
    /// Move relative to the current position.
    MoveRelative { dx: f64, dy: f64, dz: f64 },
    /// Move to a named location without consuming any slot.
    MoveToLocation { location: String },
    /// Transfer liquid between two locations.
    Pipette {
        source: String,
        dest: String,
        volume_ul: f64,
        #[serde(default)]
        keep_tip: bool,
    },
    /// Pick up the next free tip.
    NextTip,
    /// Eject the held tip into the waste container.
    EjectTip,
    /// Hold position for a duration.
    Wait {
        #[serde(with = "humantime_serde")]
        duration: Duration,
    },
    /// Pause here until an operator resumes the run.
    Breakpoint,
}

/// A named, ordered protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub name: String,
    pub operations: Vec<Operation>,
}

impl Program {
    /// Loads a program from a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> AppResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Lifecycle of the runner, published on the watch channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Paused,
    Cancelled,
    Faulted,
    Completed,
}

/// Point-in-time report returned by [`RunnerHandle::query`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunnerReport {
    pub status: RunStatus,
    /// Index of the operation most recently attempted. Holds its value
    /// through Cancelled and Faulted so the report shows how far the run
    /// got.
    pub position: usize,
    /// Last acknowledged toolhead position, if known.
    pub toolhead: Option<Coordinate>,
    pub last_error: Option<String>,
    /// Consumable cursor per plate.
    pub cursors: BTreeMap<String, usize>,
}

enum RunnerCommand {
    Start {
        program: Program,
        reply: oneshot::Sender<AppResult<()>>,
    },
    Pause {
        reply: oneshot::Sender<AppResult<()>>,
    },
    Resume {
        reply: oneshot::Sender<AppResult<()>>,
    },
    Cancel {
        reply: oneshot::Sender<AppResult<()>>,
    },
    Query {
        reply: oneshot::Sender<RunnerReport>,
    },
    ResetPlates {
        reply: oneshot::Sender<AppResult<()>>,
    },
    Shutdown,
}

/// What a boundary check decided about the run.
enum Boundary {
    Continue,
    Cancelled,
    Stopped,
    Shutdown,
}

/// Cloneable control surface for the runner task.
#[derive(Clone)]
pub struct RunnerHandle {
    control: mpsc::Sender<RunnerCommand>,
    status: watch::Receiver<RunStatus>,
    controller: ControllerHandle,
    estop: Arc<AtomicBool>,
    estop_wake: Arc<Notify>,
}

impl RunnerHandle {
    /// Starts a program. Errors with `AlreadyRunning` if one is in flight.
    pub async fn start(&self, program: Program) -> AppResult<()> {
        self.request(|reply| RunnerCommand::Start { program, reply })
            .await
    }

    /// Pauses at the next operation boundary.
    pub async fn pause(&self) -> AppResult<()> {
        self.request(|reply| RunnerCommand::Pause { reply }).await
    }

    /// Resumes a paused run.
    pub async fn resume(&self) -> AppResult<()> {
        self.request(|reply| RunnerCommand::Resume { reply }).await
    }

    /// Cancels the run at the next operation boundary.
    pub async fn cancel(&self) -> AppResult<()> {
        self.request(|reply| RunnerCommand::Cancel { reply }).await
    }

    /// Resets every consumable cursor to zero. Refused while running.
    pub async fn reset_plates(&self) -> AppResult<()> {
        self.request(|reply| RunnerCommand::ResetPlates { reply })
            .await
    }

    /// Halts the machine immediately.
    ///
    /// Synchronous on purpose: it bypasses the command queue and reaches
    /// the controller directly, even while an operation is in flight.
    pub fn emergency_stop(&self) {
        error!("emergency stop requested");
        self.estop.store(true, Ordering::SeqCst);
        self.controller.emergency_stop();
        // Dedicated wake-up, independent of the command queue: a full queue
        // must not delay noticing the stop. `notify_one` stores a permit, so
        // the wake also lands if the runner is between waits.
        self.estop_wake.notify_one();
    }

    /// Current status without waiting.
    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    /// Watch channel for status transitions.
    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.status.clone()
    }

    /// Full report: status, position, cursors, last error.
    pub async fn query(&self) -> AppResult<RunnerReport> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(RunnerCommand::Query { reply })
            .await
            .map_err(|_| PipetteError::RunnerGone)?;
        rx.await.map_err(|_| PipetteError::RunnerGone)
    }

    /// Stops the runner task once the current run finishes.
    pub async fn shutdown(&self) {
        let _ = self.control.send(RunnerCommand::Shutdown).await;
    }

    async fn request<F>(&self, make: F) -> AppResult<()>
    where
        F: FnOnce(oneshot::Sender<AppResult<()>>) -> RunnerCommand,
    {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(make(reply))
            .await
            .map_err(|_| PipetteError::RunnerGone)?;
        rx.await.map_err(|_| PipetteError::RunnerGone)?
    }
}

/// The runner task. Owns the dispatcher; one instance per engine.
pub struct Runner {
    dispatcher: Dispatcher,
    control: mpsc::Receiver<RunnerCommand>,
    status: watch::Sender<RunStatus>,
    estop: Arc<AtomicBool>,
    estop_wake: Arc<Notify>,
    snapshot_path: Option<PathBuf>,
    last_error: Option<String>,
    /// Index of the operation most recently attempted.
    position: usize,
}

impl Runner {
    /// Spawns the runner task and returns its control handle.
    pub fn spawn(
        dispatcher: Dispatcher,
        controller: ControllerHandle,
        snapshot_path: Option<PathBuf>,
    ) -> RunnerHandle {
        let (control_tx, control_rx) = mpsc::channel(32);
        let (status_tx, status_rx) = watch::channel(RunStatus::Idle);
        let estop = Arc::new(AtomicBool::new(false));
        let estop_wake = Arc::new(Notify::new());
        let runner = Runner {
            dispatcher,
            control: control_rx,
            status: status_tx,
            estop: estop.clone(),
            estop_wake: estop_wake.clone(),
            snapshot_path,
            last_error: None,
            position: 0,
        };
        tokio::spawn(runner.run());
        RunnerHandle {
            control: control_tx,
            status: status_rx,
            controller,
            estop,
            estop_wake,
        }
    }

    async fn run(mut self) {
        loop {
            let cmd = tokio::select! {
                cmd = self.control.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
                _ = self.estop_wake.notified() => {
                    if self.estop.load(Ordering::SeqCst) {
                        self.last_error = Some("emergency stop".to_string());
                        self.set_status(RunStatus::Faulted);
                    }
                    continue;
                }
            };
            match cmd {
                RunnerCommand::Start { program, reply } => {
                    let _ = reply.send(Ok(()));
                    if self.execute(program).await {
                        break;
                    }
                }
                RunnerCommand::Pause { reply }
                | RunnerCommand::Resume { reply }
                | RunnerCommand::Cancel { reply } => {
                    let _ = reply.send(Err(PipetteError::NotRunning));
                }
                RunnerCommand::Query { reply } => {
                    let _ = reply.send(self.report());
                }
                RunnerCommand::ResetPlates { reply } => {
                    self.dispatcher.deck_mut().reset_all_cursors();
                    self.save_snapshot();
                    let _ = reply.send(Ok(()));
                }
                RunnerCommand::Shutdown => break,
            }
        }
    }

    /// Runs one program to its terminal status. Returns true on shutdown.
    async fn execute(&mut self, program: Program) -> bool {
        info!(program = %program.name, operations = program.operations.len(), "run started");
        self.last_error = None;
        self.position = 0;
        self.set_status(RunStatus::Running);

        let mut outcome = RunStatus::Completed;
        for (index, op) in program.operations.iter().enumerate() {
            match self.boundary().await {
                Boundary::Continue => {}
                Boundary::Cancelled => {
                    outcome = RunStatus::Cancelled;
                    break;
                }
                Boundary::Stopped => {
                    outcome = RunStatus::Faulted;
                    break;
                }
                Boundary::Shutdown => return true,
            }
            // Cancel at the boundary above leaves `position` at the last
            // attempted operation; it is never rewound.
            self.position = index;
            if matches!(op, Operation::Breakpoint) {
                info!(index, "breakpoint reached, pausing");
                self.set_status(RunStatus::Paused);
                match self.wait_while_paused().await {
                    Boundary::Continue => continue,
                    Boundary::Cancelled => {
                        outcome = RunStatus::Cancelled;
                        break;
                    }
                    Boundary::Stopped => {
                        outcome = RunStatus::Faulted;
                        break;
                    }
                    Boundary::Shutdown => return true,
                }
            }
            if let Err(err) = self.apply(op).await {
                error!(index, %err, "operation failed, run faulted");
                self.last_error = Some(err.to_string());
                outcome = RunStatus::Faulted;
                break;
            }
            self.save_snapshot();
        }

        info!(program = %program.name, ?outcome, "run finished");
        self.set_status(outcome);
        false
    }

    /// Drains pending control messages between operations.
    async fn boundary(&mut self) -> Boundary {
        if self.estop.load(Ordering::SeqCst) {
            self.last_error = Some("emergency stop".to_string());
            return Boundary::Stopped;
        }
        loop {
            let cmd = match self.control.try_recv() {
                Ok(cmd) => cmd,
                Err(_) => return Boundary::Continue,
            };
            match cmd {
                RunnerCommand::Pause { reply } => {
                    // Publish Paused before acknowledging so a caller that
                    // awaits the reply observes the new status.
                    self.set_status(RunStatus::Paused);
                    let _ = reply.send(Ok(()));
                    match self.wait_while_paused().await {
                        Boundary::Continue => {}
                        other => return other,
                    }
                }
                RunnerCommand::Resume { reply } => {
                    // Nothing is paused at a running boundary.
                    let _ = reply.send(Err(PipetteError::NotRunning));
                }
                RunnerCommand::Cancel { reply } => {
                    let _ = reply.send(Ok(()));
                    return Boundary::Cancelled;
                }
                RunnerCommand::Start { reply, .. } => {
                    let _ = reply.send(Err(PipetteError::AlreadyRunning));
                }
                RunnerCommand::ResetPlates { reply } => {
                    let _ = reply.send(Err(PipetteError::AlreadyRunning));
                }
                RunnerCommand::Query { reply } => {
                    let _ = reply.send(self.report());
                }
                RunnerCommand::Shutdown => return Boundary::Shutdown,
            }
        }
    }

    /// Blocks until resumed, cancelled, stopped, or shut down.
    async fn wait_while_paused(&mut self) -> Boundary {
        loop {
            if self.estop.load(Ordering::SeqCst) {
                self.last_error = Some("emergency stop".to_string());
                return Boundary::Stopped;
            }
            let cmd = tokio::select! {
                cmd = self.control.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => return Boundary::Shutdown,
                },
                // Re-check the estop flag at the loop top.
                _ = self.estop_wake.notified() => continue,
            };
            match cmd {
                RunnerCommand::Resume { reply } => {
                    info!("run resumed");
                    self.set_status(RunStatus::Running);
                    let _ = reply.send(Ok(()));
                    return Boundary::Continue;
                }
                RunnerCommand::Pause { reply } => {
                    let _ = reply.send(Ok(()));
                }
                RunnerCommand::Cancel { reply } => {
                    let _ = reply.send(Ok(()));
                    return Boundary::Cancelled;
                }
                RunnerCommand::Start { reply, .. } => {
                    let _ = reply.send(Err(PipetteError::AlreadyRunning));
                }
                RunnerCommand::ResetPlates { reply } => {
                    let _ = reply.send(Err(PipetteError::AlreadyRunning));
                }
                RunnerCommand::Query { reply } => {
                    let _ = reply.send(self.report());
                }
                RunnerCommand::Shutdown => return Boundary::Shutdown,
            }
        }
    }

    async fn apply(&mut self, op: &Operation) -> AppResult<()> {
        match op {
            Operation::Home { target } => self.dispatcher.home(*target).await,
            Operation::SetLimit { kind, value } => self.dispatcher.set_limit(*kind, *value).await,
            Operation::MoveAbsolute { x, y, z } => {
                self.dispatcher.move_to(Coordinate::new(*x, *y, *z)).await
            }
            Operation::MoveRelative { dx, dy, dz } => {
                self.dispatcher.move_relative(*dx, *dy, *dz).await
            }
            Operation::MoveToLocation { location } => {
                self.dispatcher.move_to_location(location).await
            }
            Operation::Pipette {
                source,
                dest,
                volume_ul,
                keep_tip,
            } => {
                self.dispatcher
                    .pipette(source, dest, *volume_ul, *keep_tip)
                    .await
            }
            Operation::NextTip => self.dispatcher.next_tip().await,
            Operation::EjectTip => self.dispatcher.eject_tip().await,
            Operation::Wait { duration } => self.dispatcher.dwell(*duration).await,
            // Handled at the boundary, never dispatched.
            Operation::Breakpoint => Ok(()),
        }
    }

    fn report(&self) -> RunnerReport {
        RunnerReport {
            status: *self.status.borrow(),
            position: self.position,
            toolhead: self.dispatcher.last_position(),
            last_error: self.last_error.clone(),
            cursors: self.dispatcher.deck().cursors(),
        }
    }

    fn set_status(&self, status: RunStatus) {
        let _ = self.status.send(status);
    }

    fn save_snapshot(&self) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        let snapshot =
            DeckSnapshot::capture(self.dispatcher.deck(), self.dispatcher.last_position());
        if let Err(err) = snapshot.save(path) {
            warn!(%err, path = %path.display(), "failed to persist deck snapshot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationTable;
    use crate::config::{DispatchConfig, ServoConfig, SpeedConfig, WaitConfig};
    use crate::controller::MockController;
    use crate::resources::{Coordinate, Deck, DipPolicy, PlateGeometry, PlateKind};

    fn handle_with(snapshot_path: Option<PathBuf>) -> (RunnerHandle, Arc<MockController>) {
        let ctl = Arc::new(MockController::new());
        let mut deck = Deck::new();
        deck.register_plate(
            "tips",
            Coordinate::new(100.0, 50.0, 30.0),
            PlateKind::Tipbox,
            PlateGeometry {
                rows: 2,
                cols: 2,
                spacing_row: 9.0,
                spacing_col: 9.0,
            },
            DipPolicy::Constant { depth: 60.0 },
        )
        .unwrap();
        deck.register_plate(
            "vial",
            Coordinate::new(20.0, 80.0, 30.0),
            PlateKind::Singleton,
            PlateGeometry::single(),
            DipPolicy::Constant { depth: 55.0 },
        )
        .unwrap();
        deck.register_plate(
            "wells",
            Coordinate::new(60.0, 80.0, 30.0),
            PlateKind::Array,
            PlateGeometry {
                rows: 2,
                cols: 3,
                spacing_row: 9.0,
                spacing_col: 9.0,
            },
            DipPolicy::Constant { depth: 52.0 },
        )
        .unwrap();
        deck.register_plate(
            "waste",
            Coordinate::new(200.0, 10.0, 30.0),
            PlateKind::WasteContainer,
            PlateGeometry::single(),
            DipPolicy::Constant { depth: 40.0 },
        )
        .unwrap();
        let calibration = CalibrationTable::from_bins(
            &[(19.0, 11.94), (47.0, 21.54), (77.0, 31.09), (103.0, 40.6)],
            103.0,
            46.0,
        )
        .unwrap();
        let dispatcher = Dispatcher::new(
            ctl.clone(),
            deck,
            calibration,
            SpeedConfig {
                xy: 6000.0,
                z: 1500.0,
                plunger_up: 15.0,
                plunger_up_slow: 5.0,
                plunger_down: 10.0,
                factor: 1.0,
                max_velocity: 300.0,
                max_accel: 2000.0,
            },
            ServoConfig {
                angle_retract: 0.0,
                angle_ready: 110.0,
            },
            WaitConfig {
                movement: Duration::from_millis(1),
                aspirate: Duration::from_millis(1),
                eject: Duration::from_millis(1),
            },
            DispatchConfig {
                ack_timeout: Duration::from_millis(200),
                prewet_cycles: 0,
                wiggle: false,
            },
        );
        let handle = Runner::spawn(dispatcher, ctl.clone(), snapshot_path);
        (handle, ctl)
    }

    fn handle() -> (RunnerHandle, Arc<MockController>) {
        handle_with(None)
    }

    async fn wait_for(handle: &RunnerHandle, wanted: RunStatus) {
        let mut rx = handle.subscribe();
        while *rx.borrow() != wanted {
            rx.changed().await.unwrap();
        }
    }

    fn program(operations: Vec<Operation>) -> Program {
        Program {
            name: "test".to_string(),
            operations,
        }
    }

    #[tokio::test]
    async fn simple_program_runs_to_completion() {
        let (handle, ctl) = handle();
        handle
            .start(program(vec![
                Operation::Home {
                    target: HomeTarget::All,
                },
                Operation::Pipette {
                    source: "vial".to_string(),
                    dest: "wells".to_string(),
                    volume_ul: 50.0,
                    keep_tip: false,
                },
            ]))
            .await
            .unwrap();
        wait_for(&handle, RunStatus::Completed).await;

        let report = handle.query().await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.position, 1);
        assert_eq!(report.cursors.get("tips"), Some(&1));
        assert_eq!(report.cursors.get("wells"), Some(&1));
        assert!(report.last_error.is_none());
        assert_eq!(ctl.count_matching("G28"), 1);
    }

    #[tokio::test]
    async fn breakpoint_pauses_until_resumed() {
        let (handle, _ctl) = handle();
        handle
            .start(program(vec![
                Operation::Wait {
                    duration: Duration::from_millis(1),
                },
                Operation::Breakpoint,
                Operation::Wait {
                    duration: Duration::from_millis(1),
                },
            ]))
            .await
            .unwrap();
        wait_for(&handle, RunStatus::Paused).await;
        handle.resume().await.unwrap();
        wait_for(&handle, RunStatus::Completed).await;
    }

    #[tokio::test]
    async fn cancel_while_paused_ends_the_run() {
        let (handle, _ctl) = handle();
        handle
            .start(program(vec![
                Operation::Breakpoint,
                Operation::Wait {
                    duration: Duration::from_millis(1),
                },
            ]))
            .await
            .unwrap();
        wait_for(&handle, RunStatus::Paused).await;
        handle.cancel().await.unwrap();
        wait_for(&handle, RunStatus::Cancelled).await;
    }

    #[tokio::test]
    async fn second_start_is_refused_while_paused() {
        let (handle, _ctl) = handle();
        handle
            .start(program(vec![Operation::Breakpoint]))
            .await
            .unwrap();
        wait_for(&handle, RunStatus::Paused).await;

        let err = handle.start(program(vec![])).await.unwrap_err();
        assert!(matches!(err, PipetteError::AlreadyRunning));
        handle.cancel().await.unwrap();
        wait_for(&handle, RunStatus::Cancelled).await;
    }

    #[tokio::test]
    async fn control_messages_require_a_run() {
        let (handle, _ctl) = handle();
        assert!(matches!(
            handle.pause().await,
            Err(PipetteError::NotRunning)
        ));
        assert!(matches!(
            handle.resume().await,
            Err(PipetteError::NotRunning)
        ));
        assert!(matches!(
            handle.cancel().await,
            Err(PipetteError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn emergency_stop_faults_a_paused_run() {
        let (handle, ctl) = handle();
        handle
            .start(program(vec![
                Operation::Breakpoint,
                Operation::Home {
                    target: HomeTarget::All,
                },
            ]))
            .await
            .unwrap();
        wait_for(&handle, RunStatus::Paused).await;

        handle.emergency_stop();
        wait_for(&handle, RunStatus::Faulted).await;
        assert!(ctl.is_stopped());

        let report = handle.query().await.unwrap();
        assert_eq!(report.last_error.as_deref(), Some("emergency stop"));
    }

    #[tokio::test]
    async fn controller_fault_surfaces_as_faulted_run() {
        let (handle, ctl) = handle();
        ctl.fail_command(0, "Endstop z still triggered");
        handle
            .start(program(vec![Operation::Home {
                target: HomeTarget::All,
            }]))
            .await
            .unwrap();
        wait_for(&handle, RunStatus::Faulted).await;

        let report = handle.query().await.unwrap();
        assert!(report
            .last_error
            .as_deref()
            .unwrap_or_default()
            .contains("Endstop z"));
    }

    #[tokio::test]
    async fn faulted_run_reports_the_failing_operation_index() {
        let (handle, ctl) = handle();
        ctl.fail_command(0, "Endstop x still triggered");
        handle
            .start(program(vec![Operation::Home {
                target: HomeTarget::Axes,
            }]))
            .await
            .unwrap();
        wait_for(&handle, RunStatus::Faulted).await;
        assert_eq!(handle.query().await.unwrap().position, 0);

        // Same failure three operations in reports a different position.
        let (handle, ctl) = self::handle();
        ctl.fail_command(2, "Endstop x still triggered");
        handle
            .start(program(vec![
                Operation::Wait {
                    duration: Duration::from_millis(1),
                },
                Operation::Wait {
                    duration: Duration::from_millis(1),
                },
                Operation::Home {
                    target: HomeTarget::Axes,
                },
            ]))
            .await
            .unwrap();
        wait_for(&handle, RunStatus::Faulted).await;
        assert_eq!(handle.query().await.unwrap().position, 2);
    }

    #[tokio::test]
    async fn cancelled_run_keeps_the_position_it_reached() {
        let (handle, _ctl) = handle();
        handle
            .start(program(vec![
                Operation::NextTip,
                Operation::Breakpoint,
                Operation::EjectTip,
            ]))
            .await
            .unwrap();
        wait_for(&handle, RunStatus::Paused).await;
        assert_eq!(handle.query().await.unwrap().position, 1);

        handle.cancel().await.unwrap();
        wait_for(&handle, RunStatus::Cancelled).await;
        // Position is not rewound by the cancel.
        assert_eq!(handle.query().await.unwrap().position, 1);
    }

    #[tokio::test]
    async fn resume_while_running_is_refused() {
        let (handle, ctl) = handle();
        ctl.set_latency(Duration::from_millis(100));
        handle
            .start(program(vec![
                Operation::Wait {
                    duration: Duration::from_millis(1),
                },
                Operation::Wait {
                    duration: Duration::from_millis(1),
                },
            ]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(matches!(
            handle.resume().await,
            Err(PipetteError::NotRunning)
        ));
        wait_for(&handle, RunStatus::Completed).await;
    }

    #[tokio::test]
    async fn pause_waits_for_the_operation_in_flight() {
        let (handle, ctl) = handle();
        ctl.set_latency(Duration::from_millis(100));
        handle
            .start(program(vec![
                Operation::Wait {
                    duration: Duration::from_millis(1),
                },
                Operation::NextTip,
            ]))
            .await
            .unwrap();
        // Land the pause while the first operation is still awaiting its
        // acknowledgment; it must only take hold at the boundary.
        tokio::time::sleep(Duration::from_millis(25)).await;
        handle.pause().await.unwrap();

        assert_eq!(handle.status(), RunStatus::Paused);
        // The in-flight dwell completed; the tip pickup never started.
        assert_eq!(ctl.count_matching("G4"), 1);
        assert_eq!(ctl.count_matching("G1"), 0);

        handle.resume().await.unwrap();
        wait_for(&handle, RunStatus::Completed).await;
        assert_eq!(handle.query().await.unwrap().cursors.get("tips"), Some(&1));
    }

    #[tokio::test]
    async fn emergency_stop_faults_an_active_run() {
        let (handle, ctl) = handle();
        ctl.set_latency(Duration::from_millis(100));
        handle
            .start(program(vec![
                Operation::Wait {
                    duration: Duration::from_millis(1),
                },
                Operation::Home {
                    target: HomeTarget::All,
                },
            ]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        handle.emergency_stop();
        wait_for(&handle, RunStatus::Faulted).await;
        assert!(ctl.is_stopped());
    }

    #[tokio::test]
    async fn snapshot_is_written_after_each_operation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deck.json");
        let (handle, _ctl) = handle_with(Some(path.clone()));
        handle
            .start(program(vec![Operation::NextTip, Operation::EjectTip]))
            .await
            .unwrap();
        wait_for(&handle, RunStatus::Completed).await;

        let snapshot = DeckSnapshot::load(&path).unwrap().unwrap();
        assert_eq!(snapshot.cursors.get("tips"), Some(&1));
    }

    #[tokio::test]
    async fn reset_plates_rewinds_cursors_when_idle() {
        let (handle, _ctl) = handle();
        handle
            .start(program(vec![Operation::NextTip, Operation::EjectTip]))
            .await
            .unwrap();
        wait_for(&handle, RunStatus::Completed).await;
        assert_eq!(handle.query().await.unwrap().cursors.get("tips"), Some(&1));

        handle.reset_plates().await.unwrap();
        assert_eq!(handle.query().await.unwrap().cursors.get("tips"), Some(&0));
    }

    #[test]
    fn operations_deserialize_from_json() {
        let text = r#"[
            {"op": "home", "target": "all"},
            {"op": "set_limit", "kind": "velocity", "value": 200.0},
            {"op": "pipette", "source": "vial", "dest": "wells", "volume_ul": 75.0},
            {"op": "wait", "duration": "500ms"},
            {"op": "breakpoint"}
        ]"#;
        let ops: Vec<Operation> = serde_json::from_str(text).unwrap();
        assert_eq!(ops.len(), 5);
        assert_eq!(
            ops[2],
            Operation::Pipette {
                source: "vial".to_string(),
                dest: "wells".to_string(),
                volume_ul: 75.0,
                keep_tip: false,
            }
        );
        assert_eq!(
            ops[3],
            Operation::Wait {
                duration: Duration::from_millis(500)
            }
        );
    }
}
