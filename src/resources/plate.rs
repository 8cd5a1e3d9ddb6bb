//! Plate fixtures: grids of wells, tip boxes, vials, and waste containers.
//!
//! A [`Plate`] occupies a base [`Coordinate`] and exposes `rows x cols`
//! discrete positions laid out row-major: well `(r, c)` sits at
//! `base + (c * spacing_col, r * spacing_row, 0)`, 0-indexed. Consumable
//! plates carry a *cursor*, the next free slot, advanced by one on every
//! successful take. The cursor is the only mutable run state in the resource
//! model and survives restarts through [`crate::persist`].
//!
//! Running past the last slot is a hard [`PipetteError::PlateExhausted`];
//! a fresh plate must be declared explicitly by resetting the cursor, never
//! inferred by wrapping around onto already-used tips or filled wells.

use crate::error::{AppResult, PipetteError};
use crate::resources::Coordinate;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// What a plate holds, which determines how positions are served.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlateKind {
    /// Box of pipette tips, consumed one at a time.
    Tipbox,
    /// Well plate; wells fill up in linear order.
    Array,
    /// Rack of vials, consumed like an array.
    Vialholder,
    /// A single fixed vessel; always serves the same position.
    Singleton,
    /// Waste bin for ejected tips; single fixed position, never exhausts.
    WasteContainer,
}

impl PlateKind {
    /// Whether `next_slot` advances a cursor for this kind.
    pub fn is_consumable(self) -> bool {
        matches!(self, Self::Tipbox | Self::Array | Self::Vialholder)
    }
}

/// Grid dimensions and spacing for a plate.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlateGeometry {
    pub rows: u32,
    pub cols: u32,
    /// Millimeters between adjacent rows.
    #[serde(default)]
    pub spacing_row: f64,
    /// Millimeters between adjacent columns.
    #[serde(default)]
    pub spacing_col: f64,
}

impl PlateGeometry {
    /// A 1x1 grid for singletons and waste containers.
    pub fn single() -> Self {
        Self {
            rows: 1,
            cols: 1,
            spacing_row: 0.0,
            spacing_col: 0.0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.rows as usize * self.cols as usize
    }

    fn validate(&self) -> AppResult<()> {
        if self.rows < 1 || self.cols < 1 {
            return Err(PipetteError::InvalidGeometry(format!(
                "rows and cols must be at least 1, got {}x{}",
                self.rows, self.cols
            )));
        }
        if self.rows > 1 && self.spacing_row <= 0.0 {
            return Err(PipetteError::InvalidGeometry(format!(
                "spacing_row must be positive for {} rows",
                self.rows
            )));
        }
        if self.cols > 1 && self.spacing_col <= 0.0 {
            return Err(PipetteError::InvalidGeometry(format!(
                "spacing_col must be positive for {} cols",
                self.cols
            )));
        }
        Ok(())
    }
}

/// How deep the tip descends into a well before actuating.
///
/// Depths are absolute Z planes the toolhead moves to, larger meaning
/// further down into the well.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DipPolicy {
    /// Always descend to the same Z plane.
    Constant { depth: f64 },
    /// Track the liquid level of a cylindrical well: each aspirated volume
    /// lowers the level, so consecutive draws descend further, clamped at
    /// `bottom`.
    ByVolume {
        top: f64,
        bottom: f64,
        /// Well diameter in millimeters.
        diameter: f64,
    },
}

impl DipPolicy {
    fn validate(&self) -> AppResult<()> {
        match *self {
            DipPolicy::Constant { depth } => {
                if depth <= 0.0 {
                    return Err(PipetteError::InvalidGeometry(format!(
                        "dip depth must be positive, got {depth}"
                    )));
                }
            }
            DipPolicy::ByVolume {
                top,
                bottom,
                diameter,
            } => {
                if top <= 0.0 || bottom <= top {
                    return Err(PipetteError::InvalidGeometry(format!(
                        "dip range must satisfy 0 < top < bottom, got top={top} bottom={bottom}"
                    )));
                }
                if diameter <= 0.0 {
                    return Err(PipetteError::InvalidGeometry(format!(
                        "well diameter must be positive, got {diameter}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A named physical fixture on the deck.
#[derive(Clone, Debug)]
pub struct Plate {
    name: String,
    base: Coordinate,
    kind: PlateKind,
    geometry: PlateGeometry,
    dip: DipPolicy,
    /// Next free slot, 0-based. `capacity()` means exhausted.
    cursor: usize,
    /// Current dip plane for `DipPolicy::ByVolume`, between `top` and `bottom`.
    dip_level: f64,
}

impl Plate {
    pub fn new(
        name: impl Into<String>,
        base: Coordinate,
        kind: PlateKind,
        geometry: PlateGeometry,
        dip: DipPolicy,
    ) -> AppResult<Self> {
        let geometry = match kind {
            PlateKind::Singleton | PlateKind::WasteContainer => PlateGeometry::single(),
            _ => geometry,
        };
        geometry.validate()?;
        dip.validate()?;
        let dip_level = match dip {
            DipPolicy::Constant { depth } => depth,
            DipPolicy::ByVolume { top, .. } => top,
        };
        Ok(Self {
            name: name.into(),
            base,
            kind,
            geometry,
            dip,
            cursor: 0,
            dip_level,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PlateKind {
        self.kind
    }

    pub fn base(&self) -> Coordinate {
        self.base
    }

    pub fn capacity(&self) -> usize {
        self.geometry.capacity()
    }

    /// Next slot to be served, 0-based. Equal to `capacity()` once exhausted.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Restores a persisted cursor. The stored value is authoritative over
    /// the default 0; values past capacity are rejected as corrupt state.
    pub fn set_cursor(&mut self, cursor: usize) -> AppResult<()> {
        if cursor > self.capacity() {
            return Err(PipetteError::Configuration(format!(
                "restored cursor {} exceeds capacity {} of plate '{}'",
                cursor,
                self.capacity(),
                self.name
            )));
        }
        self.cursor = cursor;
        Ok(())
    }

    /// Position of the slot with the given linear index, row-major.
    pub fn position(&self, index: usize) -> AppResult<Coordinate> {
        if index >= self.capacity() {
            return Err(PipetteError::InvalidGeometry(format!(
                "slot index {} out of range for plate '{}' ({} slots)",
                index,
                self.name,
                self.capacity()
            )));
        }
        let row = (index / self.geometry.cols as usize) as f64;
        let col = (index % self.geometry.cols as usize) as f64;
        Ok(self.base.offset(
            col * self.geometry.spacing_col,
            row * self.geometry.spacing_row,
            0.0,
        ))
    }

    /// Position of well `(row, col)`, 0-indexed.
    pub fn slot_at(&self, row: u32, col: u32) -> AppResult<Coordinate> {
        if row >= self.geometry.rows || col >= self.geometry.cols {
            return Err(PipetteError::InvalidGeometry(format!(
                "well ({row}, {col}) out of range for plate '{}' ({}x{})",
                self.name, self.geometry.rows, self.geometry.cols
            )));
        }
        self.position(row as usize * self.geometry.cols as usize + col as usize)
    }

    /// Serves the next slot.
    ///
    /// Consumable kinds return the position at the cursor and advance it;
    /// singletons and waste containers always return their one position.
    pub fn next_slot(&mut self) -> AppResult<Coordinate> {
        if !self.kind.is_consumable() {
            return self.position(0);
        }
        if self.cursor >= self.capacity() {
            return Err(PipetteError::PlateExhausted(self.name.clone()));
        }
        let coor = self.position(self.cursor)?;
        self.cursor += 1;
        Ok(coor)
    }

    /// Remaining free slots (always 1 for non-consumable kinds).
    pub fn remaining(&self) -> usize {
        if self.kind.is_consumable() {
            self.capacity() - self.cursor
        } else {
            1
        }
    }

    /// Rewinds the cursor to slot 0 and resets the tracked liquid level.
    pub fn reset_cursor(&mut self) {
        self.cursor = 0;
        self.dip_level = match self.dip {
            DipPolicy::Constant { depth } => depth,
            DipPolicy::ByVolume { top, .. } => top,
        };
    }

    /// Depth to descend for the next actuation of `vol_ul` microliters.
    ///
    /// For level-tracked wells this also debits the liquid level, so call it
    /// once per aspiration.
    pub fn dip_depth(&mut self, vol_ul: f64) -> f64 {
        match self.dip {
            DipPolicy::Constant { depth } => depth,
            DipPolicy::ByVolume {
                bottom, diameter, ..
            } => {
                let radius_m = diameter / 2000.0;
                let drop_m = (vol_ul * 1e-9) / (PI * radius_m * radius_m);
                self.dip_level = (self.dip_level + drop_m * 1000.0).min(bottom);
                self.dip_level
            }
        }
    }
}
