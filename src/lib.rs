//! Protocol execution engine for an automated liquid-handling pipette.
//!
//! The engine models the deck (plates, tips, waste), converts requested
//! volumes to plunger actuation through a measured calibration table, and
//! drives an external motion controller to execute protocol programs. Runs
//! are supervised: they can be paused, resumed, cancelled, and emergency
//! stopped, and consumable cursors survive restarts through a deck snapshot.

pub mod calibration;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod monitor;
pub mod persist;
pub mod resources;
pub mod runner;

pub use error::{AppResult, PipetteError};
