//! Motion controller boundary.
//!
//! The engine treats the motion hardware as a black box behind the
//! [`MotionController`] trait: primitive moves, homing, the tip-eject servo,
//! the plunger stepper, and machine limits. Implementations own transport
//! and authentication; the core only sees acknowledged positions and
//! machine-reported faults.
//!
//! Every primitive resolves once the controller acknowledges completion.
//! `emergency_stop` is deliberately synchronous and infallible at the call
//! site: it must be issuable out-of-band while another command is still in
//! flight, without waiting on any engine lock.

pub mod mock;
pub mod remote;

pub use mock::MockController;
pub use remote::RemoteController;

use crate::error::AppResult;
use crate::resources::Coordinate;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Axes selectable for a homing cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axes {
    All,
    X,
    Y,
    Z,
}

impl fmt::Display for Axes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axes::All => write!(f, "all"),
            Axes::X => write!(f, "x"),
            Axes::Y => write!(f, "y"),
            Axes::Z => write!(f, "z"),
        }
    }
}

/// Machine limits adjustable at run time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    /// Maximum velocity, mm/s.
    Velocity,
    /// Maximum acceleration, mm/s^2.
    Acceleration,
    /// Global feed-rate multiplier.
    SpeedFactor,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitKind::Velocity => write!(f, "velocity"),
            LimitKind::Acceleration => write!(f, "acceleration"),
            LimitKind::SpeedFactor => write!(f, "speed_factor"),
        }
    }
}

/// Controller-reported machine state, returned by [`MotionController::status`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MachineStatus {
    /// Last acknowledged toolhead position; `None` before the first home or
    /// after a timeout left the position unknown.
    pub position: Option<Coordinate>,
    /// Whether all axes have been homed since power-up.
    pub homed: bool,
    /// Machine-reported fault message, if the controller is faulted.
    pub fault: Option<String>,
}

/// Primitive command interface of the external motion controller.
///
/// All methods take `&self`; implementations synchronize internally so a
/// cloned [`ControllerHandle`] can issue `emergency_stop` while a move is
/// being awaited elsewhere.
#[async_trait]
pub trait MotionController: Send + Sync {
    /// Moves the toolhead to an absolute position at `speed` mm/min.
    async fn move_absolute(&self, target: Coordinate, speed: f64) -> AppResult<Coordinate>;

    /// Moves the toolhead relative to its current position.
    async fn move_relative(&self, dx: f64, dy: f64, dz: f64, speed: f64)
        -> AppResult<Coordinate>;

    /// Homes the selected axes and returns the homed position.
    async fn home(&self, axes: Axes) -> AppResult<Coordinate>;

    /// Sets the tip-eject servo angle, in degrees.
    async fn set_servo_angle(&self, angle: f64) -> AppResult<()>;

    /// Drives the plunger stepper `distance` steps at `speed`.
    ///
    /// With `stop_on_endstop` the motion halts at the endstop and re-zeroes
    /// the stepper, which is how the plunger is homed.
    async fn actuate_stepper(&self, speed: f64, distance: f64, stop_on_endstop: bool)
        -> AppResult<()>;

    /// Adjusts a machine limit.
    async fn set_limit(&self, kind: LimitKind, value: f64) -> AppResult<()>;

    /// Pauses motion processing for the given duration.
    async fn dwell(&self, duration: Duration) -> AppResult<()>;

    /// Halts all motion immediately. Out-of-band: never blocks on in-flight
    /// commands, safe to call from any task at any time.
    fn emergency_stop(&self);

    /// Current machine state.
    async fn status(&self) -> AppResult<MachineStatus>;
}

/// Shared, cloneable handle to a controller implementation.
pub type ControllerHandle = Arc<dyn MotionController>;
