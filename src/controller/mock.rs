//! An in-memory controller that records the command stream it is given.
//!
//! Used by the test suite and by `check` runs that validate a protocol
//! without hardware. Commands are rendered in the Klipper-style dialect the
//! real firmware speaks so a recorded stream reads like the G-code the
//! engine would have shipped. Failure injection covers the two interesting
//! hardware behaviors: a scripted fault after N commands, and a stall that
//! never acknowledges (which the dispatcher turns into a timeout).

use super::{Axes, LimitKind, MachineStatus, MotionController};
use crate::error::{AppResult, PipetteError};
use crate::resources::Coordinate;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
struct MockState {
    position: Option<Coordinate>,
    homed: bool,
    log: Vec<String>,
    /// Fail the nth upcoming command (0 = the very next one).
    fault_after: Option<(usize, String)>,
    /// Pretend the firmware hung: acknowledge nothing until cleared.
    stalled: bool,
    /// Fixed acknowledgment delay applied to every command.
    latency: Option<Duration>,
    issued: usize,
}

/// Recording mock of the external motion controller.
#[derive(Debug, Default)]
pub struct MockController {
    state: Mutex<MockState>,
    estopped: AtomicBool,
}

impl MockController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the rendered command stream so far.
    pub fn commands(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    /// Number of commands matching a rendered prefix, e.g. `"MANUAL_STEPPER"`.
    pub fn count_matching(&self, prefix: &str) -> usize {
        self.lock()
            .log
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }

    /// Scripts a machine fault on the nth upcoming command (0-based).
    pub fn fail_command(&self, nth: usize, message: impl Into<String>) {
        let mut state = self.lock();
        let at = state.issued + nth;
        state.fault_after = Some((at, message.into()));
    }

    /// Makes every subsequent command hang without acknowledgment.
    pub fn stall(&self) {
        self.lock().stalled = true;
    }

    /// Delays every acknowledgment by `latency`, simulating slow motion.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    /// Whether an emergency stop was received.
    pub fn is_stopped(&self) -> bool {
        self.estopped.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // Mutex poisoning only happens if a test thread panicked while
        // holding the lock; propagating the inner state is still correct.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Admits one command: records it, applies scripted failures.
    async fn admit(&self, rendered: String) -> AppResult<()> {
        let (stalled, latency) = {
            let state = self.lock();
            (state.stalled, state.latency)
        };
        if stalled {
            // Never acknowledges; the dispatcher's timeout fires instead.
            futures::future::pending::<()>().await;
        }
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.estopped.load(Ordering::SeqCst) {
            return Err(PipetteError::ControllerFault(
                "emergency stop latched; restart firmware to continue".into(),
            ));
        }
        let mut state = self.lock();
        let n = state.issued;
        state.issued += 1;
        state.log.push(rendered);
        if let Some((at, msg)) = &state.fault_after {
            if n >= *at {
                let msg = msg.clone();
                state.fault_after = None;
                return Err(PipetteError::ControllerFault(msg));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MotionController for MockController {
    async fn move_absolute(&self, target: Coordinate, speed: f64) -> AppResult<Coordinate> {
        self.admit(format!(
            "G1 X{} Y{} Z{} F{}",
            target.x, target.y, target.z, speed
        ))
        .await?;
        self.lock().position = Some(target);
        Ok(target)
    }

    async fn move_relative(
        &self,
        dx: f64,
        dy: f64,
        dz: f64,
        speed: f64,
    ) -> AppResult<Coordinate> {
        self.admit(format!("G91\nG1 X{dx} Y{dy} Z{dz} F{speed}\nG90"))
            .await?;
        let mut state = self.lock();
        let from = state.position.unwrap_or(Coordinate::new(0.0, 0.0, 0.0));
        let to = from.offset(dx, dy, dz);
        state.position = Some(to);
        Ok(to)
    }

    async fn home(&self, axes: Axes) -> AppResult<Coordinate> {
        let rendered = match axes {
            Axes::All => "G28".to_string(),
            other => format!("G28 {}", other.to_string().to_uppercase()),
        };
        self.admit(rendered).await?;
        let mut state = self.lock();
        state.homed = true;
        let home = Coordinate::new(0.0, 0.0, 0.0);
        state.position = Some(home);
        Ok(home)
    }

    async fn set_servo_angle(&self, angle: f64) -> AppResult<()> {
        self.admit(format!("SET_SERVO SERVO=tip_servo ANGLE={angle}"))
            .await
    }

    async fn actuate_stepper(
        &self,
        speed: f64,
        distance: f64,
        stop_on_endstop: bool,
    ) -> AppResult<()> {
        let rendered = if stop_on_endstop {
            format!(
                "MANUAL_STEPPER STEPPER=plunger SPEED={speed} MOVE={distance} STOP_ON_ENDSTOP=1 SET_POSITION=0"
            )
        } else {
            format!("MANUAL_STEPPER STEPPER=plunger SPEED={speed} MOVE={distance}")
        };
        self.admit(rendered).await
    }

    async fn set_limit(&self, kind: LimitKind, value: f64) -> AppResult<()> {
        let rendered = match kind {
            LimitKind::Velocity => format!("SET_VELOCITY_LIMIT VELOCITY={value}"),
            LimitKind::Acceleration => format!("SET_VELOCITY_LIMIT ACCEL={value}"),
            LimitKind::SpeedFactor => format!("M220 S{value}"),
        };
        self.admit(rendered).await
    }

    async fn dwell(&self, duration: Duration) -> AppResult<()> {
        self.admit(format!("G4 P{}", duration.as_millis())).await
    }

    fn emergency_stop(&self) {
        // Latches without touching the state mutex so it cannot block
        // behind a stalled command.
        self.estopped.store(true, Ordering::SeqCst);
    }

    async fn status(&self) -> AppResult<MachineStatus> {
        if self.estopped.load(Ordering::SeqCst) {
            return Ok(MachineStatus {
                position: None,
                homed: false,
                fault: Some("emergency stop latched".into()),
            });
        }
        let state = self.lock();
        Ok(MachineStatus {
            position: state.position,
            homed: state.homed,
            fault: None,
        })
    }
}
