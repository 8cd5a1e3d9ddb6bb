//! Command dispatcher: logical operations to controller primitives.
//!
//! The dispatcher owns the deck, the calibration table, and the mutable
//! speed limits, and turns each logical operation into one or more primitive
//! calls against the motion controller. Every call blocks until the
//! controller acknowledges or the fixed acknowledgment window elapses; a
//! timeout surfaces as [`PipetteError::ControllerTimeout`] and leaves the
//! physical position unknown until the next successful home.
//!
//! Consumable-resource and calibration failures (`PlateExhausted`,
//! `VolumeOutOfRange`) are raised before any motion is issued for the
//! operation: the whole transfer is planned up front, so a volume the
//! calibration cannot express never moves the toolhead. A sub-step failure
//! inside a composite aborts it and surfaces the first error; already-issued
//! moves are not reversed, because a half-finished aspirate cannot be
//! replayed safely.

use crate::calibration::CalibrationTable;
use crate::config::{DispatchConfig, ServoConfig, SpeedConfig, WaitConfig};
use crate::controller::{Axes, ControllerHandle, LimitKind};
use crate::error::{AppResult, PipetteError};
use crate::resources::{Coordinate, Deck};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Stepper travel used to home the plunger against its endstop.
const PLUNGER_HOME_TRAVEL: f64 = 50.0;

/// What a home operation should home.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HomeTarget {
    /// Axes plus the pipette toolhead motors.
    All,
    /// Just the motion axes.
    Axes,
    X,
    Y,
    Z,
    /// Just the tip servo and plunger stepper.
    Pipette,
}

/// Translates logical operations into primitive controller calls.
pub struct Dispatcher {
    controller: ControllerHandle,
    deck: Deck,
    calibration: CalibrationTable,
    speed: SpeedConfig,
    servo: ServoConfig,
    wait: WaitConfig,
    config: DispatchConfig,
    has_tip: bool,
    last_position: Option<Coordinate>,
}

impl Dispatcher {
    pub fn new(
        controller: ControllerHandle,
        deck: Deck,
        calibration: CalibrationTable,
        speed: SpeedConfig,
        servo: ServoConfig,
        wait: WaitConfig,
        config: DispatchConfig,
    ) -> Self {
        Self {
            controller,
            deck,
            calibration,
            speed,
            servo,
            wait,
            config,
            has_tip: false,
            last_position: None,
        }
    }

    /// Awaits one controller primitive under the acknowledgment timeout.
    async fn timed<T, F>(&mut self, op: &str, fut: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>>,
    {
        match tokio::time::timeout(self.config.ack_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                // The command may or may not have executed; nothing can be
                // assumed about the toolhead until the next home.
                self.last_position = None;
                warn!(op, "controller acknowledgment timed out; position unknown");
                Err(PipetteError::ControllerTimeout { op: op.to_string() })
            }
        }
    }

    /// Last acknowledged toolhead position, `None` while unknown.
    pub fn last_position(&self) -> Option<Coordinate> {
        self.last_position
    }

    pub fn deck(&self) -> &Deck {
        &self.deck
    }

    pub fn deck_mut(&mut self) -> &mut Deck {
        &mut self.deck
    }

    pub fn calibration(&self) -> &CalibrationTable {
        &self.calibration
    }

    /// Startup sequence: push configured limits, home axes and toolhead.
    pub async fn initialize(&mut self) -> AppResult<()> {
        info!("initializing pipette: limits, axis home, toolhead home");
        self.set_limit(LimitKind::SpeedFactor, self.speed.factor).await?;
        self.set_limit(LimitKind::Velocity, self.speed.max_velocity).await?;
        self.set_limit(LimitKind::Acceleration, self.speed.max_accel).await?;
        self.home(HomeTarget::All).await
    }

    /// Moves the toolhead to an absolute position at XY travel speed.
    pub async fn move_to(&mut self, target: Coordinate) -> AppResult<()> {
        let ctl = self.controller.clone();
        let speed = self.speed.xy;
        let pos = self
            .timed("move", async move { ctl.move_absolute(target, speed).await })
            .await?;
        self.last_position = Some(pos);
        Ok(())
    }

    /// Moves the toolhead relative to its current position.
    pub async fn move_relative(&mut self, dx: f64, dy: f64, dz: f64) -> AppResult<()> {
        let ctl = self.controller.clone();
        let speed = self.speed.xy;
        let pos = self
            .timed("move_relative", async move {
                ctl.move_relative(dx, dy, dz, speed).await
            })
            .await?;
        self.last_position = Some(pos);
        Ok(())
    }

    /// Moves to a named location without consuming plate slots.
    pub async fn move_to_location(&mut self, name: &str) -> AppResult<()> {
        let target = self.deck.resolve(name)?;
        self.move_to(target).await
    }

    /// Homes the requested target.
    pub async fn home(&mut self, target: HomeTarget) -> AppResult<()> {
        let axes = match target {
            HomeTarget::All | HomeTarget::Axes => Some(Axes::All),
            HomeTarget::X => Some(Axes::X),
            HomeTarget::Y => Some(Axes::Y),
            HomeTarget::Z => Some(Axes::Z),
            HomeTarget::Pipette => None,
        };
        if let Some(axes) = axes {
            let ctl = self.controller.clone();
            let pos = self
                .timed("home", async move { ctl.home(axes).await })
                .await?;
            self.last_position = Some(pos);
        }
        if matches!(target, HomeTarget::All | HomeTarget::Pipette) {
            self.home_pipette().await?;
        }
        Ok(())
    }

    /// Retracts the tip servo and homes the plunger against its endstop.
    async fn home_pipette(&mut self) -> AppResult<()> {
        self.set_servo(self.servo.angle_retract).await?;
        self.dwell(self.wait.movement).await?;
        let ctl = self.controller.clone();
        let speed = self.speed.plunger_up_slow;
        self.timed("home_plunger", async move {
            ctl.actuate_stepper(speed, PLUNGER_HOME_TRAVEL, true).await
        })
        .await
    }

    /// Adjusts a machine limit, keeping the configuration struct in sync so
    /// later reads see the running value.
    pub async fn set_limit(&mut self, kind: LimitKind, value: f64) -> AppResult<()> {
        if !value.is_finite() || value <= 0.0 {
            return Err(PipetteError::Configuration(format!(
                "limit {kind} must be positive, got {value}"
            )));
        }
        match kind {
            LimitKind::Velocity => self.speed.max_velocity = value,
            LimitKind::Acceleration => self.speed.max_accel = value,
            LimitKind::SpeedFactor => self.speed.factor = value,
        }
        let ctl = self.controller.clone();
        self.timed("set_limit", async move { ctl.set_limit(kind, value).await })
            .await
    }

    pub async fn set_servo(&mut self, angle: f64) -> AppResult<()> {
        let ctl = self.controller.clone();
        self.timed("set_servo", async move { ctl.set_servo_angle(angle).await })
            .await
    }

    /// Issues a controller dwell.
    pub async fn dwell(&mut self, duration: Duration) -> AppResult<()> {
        let ctl = self.controller.clone();
        self.timed("dwell", async move { ctl.dwell(duration).await })
            .await
    }

    /// Drives the plunger down by `steps` (negative stepper travel).
    async fn plunge(&mut self, steps: f64, speed: f64) -> AppResult<()> {
        let ctl = self.controller.clone();
        self.timed("plunge", async move {
            ctl.actuate_stepper(speed, -steps, false).await
        })
        .await
    }

    /// Releases the plunger by homing it against the endstop.
    async fn release_plunger(&mut self, speed: f64) -> AppResult<()> {
        let ctl = self.controller.clone();
        self.timed("release_plunger", async move {
            ctl.actuate_stepper(speed, PLUNGER_HOME_TRAVEL, true).await
        })
        .await
    }

    /// Descends to a dip plane above the given XY, then settles.
    async fn dip_down(&mut self, at: Coordinate, dip_z: f64) -> AppResult<()> {
        self.move_to(at.with_z(dip_z)).await?;
        self.dwell(self.wait.movement).await
    }

    /// Returns to the location's travel height, then settles.
    async fn dip_return(&mut self, at: Coordinate) -> AppResult<()> {
        self.move_to(at).await?;
        self.dwell(self.wait.movement).await
    }

    /// Picks up the next free tip.
    ///
    /// Refuses a second pickup while a tip is held: stacking tips bends the
    /// mount. (Ejecting, by contrast, is unconditional: the controller
    /// cannot report tip presence, so an empty eject must be harmless.)
    pub async fn next_tip(&mut self) -> AppResult<()> {
        if self.has_tip {
            return Err(PipetteError::TipAlreadyOn);
        }
        let (slot, dip_z) = self.deck.next_tip_slot()?;
        debug!(%slot, "picking up tip");
        self.move_to(slot).await?;
        self.dip_down(slot, dip_z).await?;
        self.dip_return(slot).await?;
        self.has_tip = true;
        Ok(())
    }

    /// Ejects the held tip into the waste container.
    ///
    /// Idempotent at this layer; ejecting with no tip held is not an error.
    pub async fn eject_tip(&mut self) -> AppResult<()> {
        let (slot, dip_z) = self.deck.waste_slot()?;
        debug!(%slot, "ejecting tip");
        self.move_to(slot).await?;
        self.dip_down(slot, dip_z).await?;
        self.set_servo(self.servo.angle_retract).await?;
        self.set_servo(self.servo.angle_ready).await?;
        self.dwell(self.wait.eject).await?;
        self.set_servo(self.servo.angle_retract).await?;
        self.dwell(self.wait.movement).await?;
        self.dip_return(slot).await?;
        self.has_tip = false;
        Ok(())
    }

    pub fn has_tip(&self) -> bool {
        self.has_tip
    }

    /// Moves `vol_ul` of liquid from `source` to `dest`.
    ///
    /// Volumes above the single-transfer maximum are split into
    /// full-`max_vol` transfers plus a remainder, all sharing one tip. The
    /// transfer plan, including every calibration lookup, is computed before
    /// the first move so range errors are pre-flight, not motion-time.
    pub async fn pipette(
        &mut self,
        source: &str,
        dest: &str,
        vol_ul: f64,
        keep_tip: bool,
    ) -> AppResult<()> {
        if !vol_ul.is_finite() || vol_ul <= 0.0 {
            return Err(PipetteError::VolumeOutOfRange {
                requested: vol_ul,
                max: self.calibration.max_vol(),
            });
        }

        // Pre-flight: plan all transfers and resolve both endpoints before
        // any motion.
        let max_vol = self.calibration.max_vol();
        let mut plan: Vec<(f64, f64)> = Vec::new();
        let mut remaining = vol_ul;
        // Tolerance absorbs float residue from repeated subtraction.
        while remaining > 1e-9 {
            let chunk = remaining.min(max_vol);
            plan.push((chunk, self.calibration.vol_to_steps(chunk)?));
            remaining -= chunk;
        }
        let coor_source = self.deck.next_slot(source)?;
        let coor_dest = self.deck.next_slot(dest)?;
        let dispense_steps = self.calibration.dispense_steps();

        info!(source, dest, vol_ul, transfers = plan.len(), "pipetting");

        if !self.has_tip {
            self.next_tip().await?;
        }

        for (chunk, steps) in plan {
            let src_dip = self.deck.dip_depth(source, chunk)?;
            let dest_dip = self.deck.dip_depth(dest, 0.0)?;

            // Aspirate: pre-plunge above the liquid, dip, release to draw.
            self.move_to(coor_source).await?;
            self.plunge(steps, self.speed.plunger_down).await?;
            self.dip_down(coor_source, src_dip).await?;
            for _ in 0..self.config.prewet_cycles {
                self.release_plunger(self.speed.plunger_up_slow).await?;
                self.dwell(self.wait.aspirate).await?;
                self.plunge(steps, self.speed.plunger_down).await?;
                self.dwell(self.wait.aspirate).await?;
            }
            self.release_plunger(self.speed.plunger_up_slow).await?;
            self.dwell(self.wait.aspirate).await?;
            self.dip_return(coor_source).await?;

            // Dispense: dip into the destination and push the full stroke.
            self.move_to(coor_dest).await?;
            self.dip_down(coor_dest, dest_dip).await?;
            self.plunge(dispense_steps, self.speed.plunger_down).await?;
            if self.config.wiggle {
                self.wiggle(coor_dest, dest_dip).await?;
            }
            self.dwell(self.wait.aspirate).await?;
            self.dip_return(coor_dest).await?;
            self.release_plunger(self.speed.plunger_up).await?;
        }

        if !keep_tip {
            self.eject_tip().await?;
        }
        Ok(())
    }

    /// Shakes the tip in a small cross pattern to drop clinging liquid.
    async fn wiggle(&mut self, at: Coordinate, dip_z: f64) -> AppResult<()> {
        let center = at.with_z(dip_z);
        for (dx, dy) in [
            (1.0, 0.0),
            (0.0, 0.0),
            (-1.0, 0.0),
            (0.0, 0.0),
            (0.0, 1.0),
            (0.0, 0.0),
            (0.0, -1.0),
            (0.0, 0.0),
        ] {
            self.move_to(center.offset(dx, dy, 0.0)).await?;
        }
        Ok(())
    }

    /// Forwards an emergency stop straight to the controller.
    ///
    /// Synchronous and lock-free so it can preempt an in-flight dispatch.
    pub fn emergency_stop(&self) {
        self.controller.emergency_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationTable;
    use crate::controller::MockController;
    use crate::resources::{DipPolicy, PlateGeometry, PlateKind};
    use std::sync::Arc;

    fn speed() -> SpeedConfig {
        SpeedConfig {
            xy: 6000.0,
            z: 1500.0,
            plunger_up: 15.0,
            plunger_up_slow: 5.0,
            plunger_down: 10.0,
            factor: 1.0,
            max_velocity: 300.0,
            max_accel: 2000.0,
        }
    }

    fn servo() -> ServoConfig {
        ServoConfig {
            angle_retract: 0.0,
            angle_ready: 110.0,
        }
    }

    fn wait() -> WaitConfig {
        WaitConfig {
            movement: Duration::from_millis(1),
            aspirate: Duration::from_millis(1),
            eject: Duration::from_millis(1),
        }
    }

    fn deck() -> Deck {
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
                rows: 4,
                cols: 6,
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
        deck
    }

    fn dispatcher(ctl: Arc<MockController>) -> Dispatcher {
        let calibration = CalibrationTable::from_bins(
            &[(19.0, 11.94), (47.0, 21.54), (77.0, 31.09), (103.0, 40.6)],
            103.0,
            46.0,
        )
        .unwrap();
        Dispatcher::new(
            ctl,
            deck(),
            calibration,
            speed(),
            servo(),
            wait(),
            DispatchConfig {
                ack_timeout: Duration::from_millis(200),
                prewet_cycles: 0,
                wiggle: false,
            },
        )
    }

    #[tokio::test]
    async fn pipette_consumes_one_tip_and_one_aspirate_dispense_pair() {
        let ctl = Arc::new(MockController::new());
        let mut d = dispatcher(ctl.clone());
        d.pipette("vial", "wells", 50.0, false).await.unwrap();

        assert_eq!(d.deck().cursors().get("tips"), Some(&1));
        assert_eq!(d.deck().cursors().get("wells"), Some(&1));
        // One pre-plunge, one dispense stroke, plus releases against the
        // endstop; exactly two downward (negative-move) strokes.
        let down_strokes = ctl
            .commands()
            .iter()
            .filter(|c| c.contains("MOVE=-"))
            .count();
        assert_eq!(down_strokes, 2);
        assert!(!d.has_tip());
    }

    #[tokio::test]
    async fn oversized_volume_splits_into_max_vol_transfers() {
        let ctl = Arc::new(MockController::new());
        let mut d = dispatcher(ctl.clone());
        // 103 max => 250 splits into 103 + 103 + 44.
        d.pipette("vial", "wells", 250.0, false).await.unwrap();
        let down_strokes = ctl
            .commands()
            .iter()
            .filter(|c| c.contains("MOVE=-"))
            .count();
        // Three aspirate pre-plunges and three dispense strokes.
        assert_eq!(down_strokes, 6);
        // Still one tip for the whole transfer.
        assert_eq!(d.deck().cursors().get("tips"), Some(&1));
    }

    #[tokio::test]
    async fn out_of_range_volume_issues_no_motion() {
        let ctl = Arc::new(MockController::new());
        let mut d = dispatcher(ctl.clone());
        let err = d.pipette("vial", "wells", 5.0, false).await.unwrap_err();
        assert!(matches!(err, PipetteError::VolumeOutOfRange { .. }));
        assert!(ctl.commands().is_empty());
        // Pre-flight failure must not consume slots either.
        assert_eq!(d.deck().cursors().get("tips"), Some(&0));
        assert_eq!(d.deck().cursors().get("wells"), Some(&0));
    }

    #[tokio::test]
    async fn second_pickup_without_eject_is_refused() {
        let ctl = Arc::new(MockController::new());
        let mut d = dispatcher(ctl);
        d.next_tip().await.unwrap();
        assert!(matches!(
            d.next_tip().await,
            Err(PipetteError::TipAlreadyOn)
        ));
        // Ejecting twice is fine.
        d.eject_tip().await.unwrap();
        d.eject_tip().await.unwrap();
    }

    #[tokio::test]
    async fn stalled_controller_times_out_and_forgets_position() {
        let ctl = Arc::new(MockController::new());
        let mut d = dispatcher(ctl.clone());
        d.home(HomeTarget::Axes).await.unwrap();
        assert!(d.last_position().is_some());

        ctl.stall();
        let err = d.move_to(Coordinate::new(1.0, 2.0, 3.0)).await.unwrap_err();
        assert!(matches!(err, PipetteError::ControllerTimeout { .. }));
        assert!(d.last_position().is_none());
    }

    #[tokio::test]
    async fn set_limit_updates_running_config() {
        let ctl = Arc::new(MockController::new());
        let mut d = dispatcher(ctl.clone());
        d.set_limit(LimitKind::Velocity, 150.0).await.unwrap();
        assert_eq!(d.speed.max_velocity, 150.0);
        assert!(ctl
            .commands()
            .iter()
            .any(|c| c == "SET_VELOCITY_LIMIT VELOCITY=150"));
        assert!(d.set_limit(LimitKind::Velocity, -1.0).await.is_err());
    }
}
