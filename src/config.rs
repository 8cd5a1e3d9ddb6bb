//! Typed configuration loading.
//!
//! Settings are loaded with figment from a TOML profile plus
//! `AUTOPIPETTE_`-prefixed environment overrides:
//!
//! ```text
//! AUTOPIPETTE_SPEED_XY=4500
//! AUTOPIPETTE_NETWORK_HOST=mainsail.local
//! ```
//!
//! A profile describes one physical pipette (a P100 and a P1000 head have
//! different calibration tables and speeds), so switching profiles swaps the
//! whole `Settings`. Coordinate entries may omit their Z and inherit the
//! shared travel altitude; that reference is resolved here at load time,
//! before the deck is built, so the resource model only ever sees concrete
//! numbers.

use crate::calibration::{CalibrationSample, CalibrationTable};
use crate::error::{AppResult, PipetteError};
use crate::resources::{Coordinate, Deck, DipPolicy, PlateGeometry, PlateKind};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level engine configuration, one per pipette profile.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    pub speed: SpeedConfig,
    pub servo: ServoConfig,
    #[serde(default)]
    pub wait: WaitConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    pub calibration: CalibrationConfig,
    /// Named bare coordinates.
    #[serde(default, rename = "coordinate")]
    pub coordinates: Vec<CoordinateEntry>,
    /// Named plate fixtures.
    #[serde(default, rename = "plate")]
    pub plates: Vec<PlateEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Where the deck snapshot is persisted across restarts.
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
    /// Logging filter when RUST_LOG is unset (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
            log_level: default_log_level(),
        }
    }
}

/// Endpoint of the motion controller's API server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Feed rates (mm/min for moves, stepper units for the plunger) and limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpeedConfig {
    /// Travel speed in the XY plane.
    pub xy: f64,
    /// Travel speed for Z dips.
    pub z: f64,
    /// Plunger speed when releasing to aspirate.
    pub plunger_up: f64,
    /// Slow plunger release used while the tip is submerged.
    pub plunger_up_slow: f64,
    /// Plunger speed when plunging to dispense.
    pub plunger_down: f64,
    /// Global feed-rate multiplier applied at startup.
    #[serde(default = "default_speed_factor")]
    pub factor: f64,
    /// Machine velocity limit, mm/s.
    pub max_velocity: f64,
    /// Machine acceleration limit, mm/s^2.
    pub max_accel: f64,
}

/// Tip-eject servo positions, degrees.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServoConfig {
    pub angle_retract: f64,
    pub angle_ready: f64,
}

/// Settle times between motion phases.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WaitConfig {
    /// After any dip or raise, before actuating.
    #[serde(with = "humantime_serde", default = "default_wait_movement")]
    pub movement: Duration,
    /// After releasing the plunger, letting liquid enter the tip.
    #[serde(with = "humantime_serde", default = "default_wait_aspirate")]
    pub aspirate: Duration,
    /// During the servo eject stroke.
    #[serde(with = "humantime_serde", default = "default_wait_eject")]
    pub eject: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            movement: default_wait_movement(),
            aspirate: default_wait_aspirate(),
            eject: default_wait_eject(),
        }
    }
}

/// Dispatcher behavior knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// How long to wait for controller acknowledgment before declaring the
    /// position unknown.
    #[serde(with = "humantime_serde", default = "default_ack_timeout")]
    pub ack_timeout: Duration,
    /// Pre-wet cycles before the measuring aspirate (0 disables).
    #[serde(default)]
    pub prewet_cycles: u32,
    /// Shake off clinging droplets after dispensing.
    #[serde(default)]
    pub wiggle: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            ack_timeout: default_ack_timeout(),
            prewet_cycles: 0,
            wiggle: false,
        }
    }
}

/// Alert monitor cadence and buffering.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// How often the controller is polled for machine faults.
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Alert buffer size; alerts beyond it are dropped with a warning.
    #[serde(default = "default_alert_capacity")]
    pub alert_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            alert_capacity: default_alert_capacity(),
        }
    }
}

/// Raw calibration data for this pipette head.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Largest volume a single transfer may request, in uL.
    pub max_vol: f64,
    /// Fixed displacement used to clear the tip when dispensing.
    #[serde(default = "default_dispense_steps")]
    pub dispense_steps: f64,
    pub samples: Vec<CalibrationSample>,
}

/// A named coordinate in a profile. `z` may be omitted to inherit the
/// shared travel altitude (`travel_z`), resolved at load time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoordinateEntry {
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub z: Option<f64>,
}

/// A named plate fixture in a profile.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlateEntry {
    pub name: String,
    pub kind: PlateKind,
    pub x: f64,
    pub y: f64,
    pub z: Option<f64>,
    #[serde(default = "default_rows")]
    pub rows: u32,
    #[serde(default = "default_rows")]
    pub cols: u32,
    #[serde(default)]
    pub spacing_row: f64,
    #[serde(default)]
    pub spacing_col: f64,
    pub dip: DipPolicy,
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("state/deck.json")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    7125
}

fn default_speed_factor() -> f64 {
    1.0
}

fn default_wait_movement() -> Duration {
    Duration::from_millis(300)
}

fn default_wait_aspirate() -> Duration {
    Duration::from_millis(1500)
}

fn default_wait_eject() -> Duration {
    Duration::from_millis(500)
}

fn default_ack_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_alert_capacity() -> usize {
    32
}

fn default_dispense_steps() -> f64 {
    46.0
}

fn default_rows() -> u32 {
    1
}

/// The shared travel altitude coordinates inherit when their own Z is
/// omitted. Conventionally registered as the `safe` coordinate.
pub const TRAVEL_COORDINATE: &str = "safe";

impl Settings {
    /// Loads a profile TOML with environment overrides and validates it.
    pub fn load(path: &Path) -> AppResult<Self> {
        let settings: Settings = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("AUTOPIPETTE_").split("_"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic checks that parse cannot catch.
    pub fn validate(&self) -> AppResult<()> {
        for (label, value) in [
            ("speed.xy", self.speed.xy),
            ("speed.z", self.speed.z),
            ("speed.plunger_up", self.speed.plunger_up),
            ("speed.plunger_up_slow", self.speed.plunger_up_slow),
            ("speed.plunger_down", self.speed.plunger_down),
            ("speed.factor", self.speed.factor),
            ("speed.max_velocity", self.speed.max_velocity),
            ("speed.max_accel", self.speed.max_accel),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(PipetteError::Configuration(format!(
                    "{label} must be positive, got {value}"
                )));
            }
        }
        if self.calibration.samples.is_empty() {
            return Err(PipetteError::Configuration(
                "calibration.samples must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// The shared travel altitude, taken from the `safe` coordinate when one
    /// is declared with an explicit Z.
    fn travel_z(&self) -> Option<f64> {
        self.coordinates
            .iter()
            .find(|c| c.name == TRAVEL_COORDINATE)
            .and_then(|c| c.z)
    }

    /// Builds the deck from the profile's coordinate and plate entries.
    ///
    /// Derived Z references are resolved here, before registration, so the
    /// deck only holds concrete coordinates.
    pub fn build_deck(&self) -> AppResult<Deck> {
        let travel_z = self.travel_z();
        let resolve_z = |name: &str, z: Option<f64>| -> AppResult<f64> {
            z.or(travel_z).ok_or_else(|| {
                PipetteError::Configuration(format!(
                    "'{name}' omits z and no '{TRAVEL_COORDINATE}' coordinate provides one"
                ))
            })
        };

        let mut deck = Deck::new();
        for entry in &self.coordinates {
            let z = resolve_z(&entry.name, entry.z)?;
            deck.register_coordinate(&entry.name, Coordinate::new(entry.x, entry.y, z))?;
        }
        for entry in &self.plates {
            let z = resolve_z(&entry.name, entry.z)?;
            deck.register_plate(
                &entry.name,
                Coordinate::new(entry.x, entry.y, z),
                entry.kind,
                PlateGeometry {
                    rows: entry.rows,
                    cols: entry.cols,
                    spacing_row: entry.spacing_row,
                    spacing_col: entry.spacing_col,
                },
                entry.dip,
            )?;
        }
        Ok(deck)
    }

    /// Builds the calibration table from the profile's recorded samples.
    pub fn build_calibration(&self) -> AppResult<CalibrationTable> {
        CalibrationTable::from_samples(
            &self.calibration.samples,
            self.calibration.max_vol,
            self.calibration.dispense_steps,
        )
    }
}
