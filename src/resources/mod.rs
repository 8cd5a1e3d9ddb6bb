//! The deck: named machine-space locations and plate fixtures.
//!
//! The [`Deck`] is the resource model for one pipetting setup. It owns every
//! named [`Coordinate`] and [`Plate`] and serves coordinate resolution for
//! protocol commands. Plate cursors are its only mutable run state; they are
//! exported and restored through [`crate::persist`] so an interrupted run
//! resumes with correct physical assumptions.
//!
//! Cursor mutations are not internally locked. The protocol runner is the
//! sole caller during an active run; resetting a plate while a run still
//! references it is the caller's responsibility to avoid.

mod coordinate;
mod plate;

pub use coordinate::Coordinate;
pub use plate::{DipPolicy, Plate, PlateGeometry, PlateKind};

use crate::error::{AppResult, PipetteError};
use std::collections::BTreeMap;
use tracing::debug;

/// A named entry on the deck: a bare point or a plate fixture.
#[derive(Clone, Debug)]
enum Location {
    Point(Coordinate),
    Plate(Plate),
}

/// Resource model for one pipetting setup.
#[derive(Clone, Debug, Default)]
pub struct Deck {
    locations: BTreeMap<String, Location>,
    /// Tip boxes in registration order; `next_tip_slot` chains through them.
    tipboxes: Vec<String>,
    waste: Option<String>,
}

impl Deck {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a bare named coordinate.
    pub fn register_coordinate(
        &mut self,
        name: impl Into<String>,
        coor: Coordinate,
    ) -> AppResult<()> {
        let name = name.into();
        if self.locations.contains_key(&name) {
            return Err(PipetteError::DuplicateName(name));
        }
        debug!(name, %coor, "registered coordinate");
        self.locations.insert(name, Location::Point(coor));
        Ok(())
    }

    /// Registers a plate fixture at a base coordinate.
    ///
    /// Tip boxes and the waste container are remembered so tip handling can
    /// find them without the caller naming them on every operation.
    pub fn register_plate(
        &mut self,
        name: impl Into<String>,
        base: Coordinate,
        kind: PlateKind,
        geometry: PlateGeometry,
        dip: DipPolicy,
    ) -> AppResult<()> {
        let name = name.into();
        if self.locations.contains_key(&name) {
            return Err(PipetteError::DuplicateName(name));
        }
        let plate = Plate::new(name.clone(), base, kind, geometry, dip)?;
        match kind {
            PlateKind::Tipbox => self.tipboxes.push(name.clone()),
            PlateKind::WasteContainer => self.waste = Some(name.clone()),
            _ => {}
        }
        debug!(name, ?kind, capacity = plate.capacity(), "registered plate");
        self.locations.insert(name, Location::Plate(plate));
        Ok(())
    }

    pub fn is_location(&self, name: &str) -> bool {
        self.locations.contains_key(name)
    }

    /// Resolves a name to its coordinate: the point itself, or a plate's
    /// base position. Does not consume plate slots.
    pub fn resolve(&self, name: &str) -> AppResult<Coordinate> {
        match self.locations.get(name) {
            Some(Location::Point(c)) => Ok(*c),
            Some(Location::Plate(p)) => Ok(p.base()),
            None => Err(PipetteError::UnknownLocation(name.to_string())),
        }
    }

    /// Serves the next slot of a plate, advancing its cursor.
    ///
    /// A bare coordinate resolves to itself and never advances, so protocol
    /// sources can be plates and plain locations interchangeably.
    pub fn next_slot(&mut self, name: &str) -> AppResult<Coordinate> {
        match self.locations.get_mut(name) {
            Some(Location::Plate(p)) => p.next_slot(),
            Some(Location::Point(c)) => Ok(*c),
            None => Err(PipetteError::UnknownLocation(name.to_string())),
        }
    }

    /// Position of well `(row, col)` on a plate, 0-indexed, no cursor change.
    pub fn slot_at(&self, name: &str, row: u32, col: u32) -> AppResult<Coordinate> {
        match self.locations.get(name) {
            Some(Location::Plate(p)) => p.slot_at(row, col),
            Some(Location::Point(_)) => Err(PipetteError::InvalidGeometry(format!(
                "'{name}' is a bare coordinate, not a plate"
            ))),
            None => Err(PipetteError::UnknownLocation(name.to_string())),
        }
    }

    /// Dip depth for the next actuation of `vol_ul` at this location.
    ///
    /// Bare coordinates have no well to descend into and return 0.
    pub fn dip_depth(&mut self, name: &str, vol_ul: f64) -> AppResult<f64> {
        match self.locations.get_mut(name) {
            Some(Location::Plate(p)) => Ok(p.dip_depth(vol_ul)),
            Some(Location::Point(_)) => Ok(0.0),
            None => Err(PipetteError::UnknownLocation(name.to_string())),
        }
    }

    /// Takes the next free tip, chaining through tip boxes in registration
    /// order. Returns the tip position and the dip depth for pickup.
    pub fn next_tip_slot(&mut self) -> AppResult<(Coordinate, f64)> {
        if self.tipboxes.is_empty() {
            return Err(PipetteError::NoTipbox);
        }
        let boxes = self.tipboxes.clone();
        let last = boxes.len() - 1;
        for (i, name) in boxes.iter().enumerate() {
            let Some(Location::Plate(plate)) = self.locations.get_mut(name) else {
                continue;
            };
            match plate.next_slot() {
                Ok(coor) => {
                    let depth = plate.dip_depth(0.0);
                    return Ok((coor, depth));
                }
                // Box is empty; fall through to the next one.
                Err(PipetteError::PlateExhausted(_)) if i < last => continue,
                Err(e) => return Err(e),
            }
        }
        Err(PipetteError::NoTipbox)
    }

    /// The waste container position and its dip depth for tip ejection.
    pub fn waste_slot(&mut self) -> AppResult<(Coordinate, f64)> {
        let name = self.waste.clone().ok_or(PipetteError::NoWasteContainer)?;
        let coor = self.next_slot(&name)?;
        let depth = self.dip_depth(&name, 0.0)?;
        Ok((coor, depth))
    }

    /// Rewinds one plate's cursor to slot 0.
    pub fn reset_cursor(&mut self, name: &str) -> AppResult<()> {
        match self.locations.get_mut(name) {
            Some(Location::Plate(p)) => {
                p.reset_cursor();
                Ok(())
            }
            Some(Location::Point(_)) => Err(PipetteError::InvalidGeometry(format!(
                "'{name}' is a bare coordinate, not a plate"
            ))),
            None => Err(PipetteError::UnknownLocation(name.to_string())),
        }
    }

    /// Rewinds every plate cursor to slot 0.
    pub fn reset_all_cursors(&mut self) {
        for loc in self.locations.values_mut() {
            if let Location::Plate(p) = loc {
                p.reset_cursor();
            }
        }
    }

    /// Current cursor values for all plates, for persistence.
    pub fn cursors(&self) -> BTreeMap<String, usize> {
        self.locations
            .iter()
            .filter_map(|(name, loc)| match loc {
                Location::Plate(p) => Some((name.clone(), p.cursor())),
                Location::Point(_) => None,
            })
            .collect()
    }

    /// Restores persisted cursor values; stored state is authoritative.
    ///
    /// Entries naming plates that no longer exist are skipped with a log
    /// line rather than failing the whole restore, so editing a profile
    /// between runs does not strand the snapshot.
    pub fn restore_cursors(&mut self, cursors: &BTreeMap<String, usize>) -> AppResult<()> {
        for (name, &cursor) in cursors {
            match self.locations.get_mut(name) {
                Some(Location::Plate(p)) => p.set_cursor(cursor)?,
                _ => debug!(name, cursor, "skipping cursor for unknown plate"),
            }
        }
        Ok(())
    }

    /// Names of every registered location.
    pub fn location_names(&self) -> Vec<String> {
        self.locations.keys().cloned().collect()
    }

    /// Names of locations that are plates.
    pub fn plate_names(&self) -> Vec<String> {
        self.locations
            .iter()
            .filter_map(|(name, loc)| match loc {
                Location::Plate(_) => Some(name.clone()),
                Location::Point(_) => None,
            })
            .collect()
    }

    /// Remaining free slots on a plate.
    pub fn remaining(&self, name: &str) -> AppResult<usize> {
        match self.locations.get(name) {
            Some(Location::Plate(p)) => Ok(p.remaining()),
            Some(Location::Point(_)) => Ok(1),
            None => Err(PipetteError::UnknownLocation(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deck() -> Deck {
        let mut deck = Deck::new();
        deck.register_coordinate("safe", Coordinate::new(0.0, 0.0, 10.0))
            .unwrap();
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
            "waste",
            Coordinate::new(200.0, 10.0, 30.0),
            PlateKind::WasteContainer,
            PlateGeometry::single(),
            DipPolicy::Constant { depth: 40.0 },
        )
        .unwrap();
        deck
    }

    #[test]
    fn resolve_rejects_unknown_names() {
        let deck = deck();
        assert!(deck.resolve("safe").is_ok());
        assert!(matches!(
            deck.resolve("nowhere"),
            Err(PipetteError::UnknownLocation(_))
        ));
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut deck = deck();
        assert!(matches!(
            deck.register_coordinate("safe", Coordinate::new(1.0, 1.0, 1.0)),
            Err(PipetteError::DuplicateName(_))
        ));
    }

    #[test]
    fn tip_slots_chain_across_boxes() {
        let mut deck = deck();
        deck.register_plate(
            "tips2",
            Coordinate::new(150.0, 50.0, 30.0),
            PlateKind::Tipbox,
            PlateGeometry {
                rows: 1,
                cols: 1,
                spacing_row: 0.0,
                spacing_col: 0.0,
            },
            DipPolicy::Constant { depth: 60.0 },
        )
        .unwrap();
        // Drain the first box.
        for _ in 0..4 {
            deck.next_tip_slot().unwrap();
        }
        let (coor, _) = deck.next_tip_slot().unwrap();
        assert_eq!(coor, Coordinate::new(150.0, 50.0, 30.0));
        // Both boxes empty now.
        assert!(matches!(
            deck.next_tip_slot(),
            Err(PipetteError::PlateExhausted(_))
        ));
    }

    #[test]
    fn waste_slot_never_exhausts() {
        let mut deck = deck();
        for _ in 0..10 {
            let (coor, depth) = deck.waste_slot().unwrap();
            assert_eq!(coor, Coordinate::new(200.0, 10.0, 30.0));
            assert_eq!(depth, 40.0);
        }
    }

    #[test]
    fn cursors_round_trip_through_snapshot_map() {
        let mut deck = deck();
        deck.next_slot("tips").unwrap();
        deck.next_slot("tips").unwrap();
        let saved = deck.cursors();
        assert_eq!(saved.get("tips"), Some(&2));

        let mut fresh = self::deck();
        fresh.restore_cursors(&saved).unwrap();
        // Restored cursor is authoritative: next slot is index 2.
        let coor = fresh.next_slot("tips").unwrap();
        assert_eq!(coor, Coordinate::new(100.0, 59.0, 30.0));
    }

    #[test]
    fn reset_all_rewinds_every_plate() {
        let mut deck = deck();
        deck.next_slot("tips").unwrap();
        deck.reset_all_cursors();
        assert_eq!(deck.cursors().get("tips"), Some(&0));
    }
}
