//! Durable deck state across process restarts.
//!
//! A [`DeckSnapshot`] records every plate cursor and the last known machine
//! position. It is written as JSON after state-changing operations and read
//! back at startup, where it is authoritative over the profile defaults:
//! a restart must not hand out tips or wells that were already consumed.
//!
//! serde_json round-trips `usize` cursors and `f64` coordinates exactly,
//! which is the property the snapshot format needs.

use crate::error::AppResult;
use crate::resources::{Coordinate, Deck};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

/// Persisted engine state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeckSnapshot {
    /// Plate name to next-free-slot index.
    pub cursors: BTreeMap<String, usize>,
    /// Machine position after the last acknowledged move, if any.
    pub last_position: Option<Coordinate>,
    pub saved_at: DateTime<Utc>,
}

impl DeckSnapshot {
    /// Captures the current deck state.
    pub fn capture(deck: &Deck, last_position: Option<Coordinate>) -> Self {
        Self {
            cursors: deck.cursors(),
            last_position,
            saved_at: Utc::now(),
        }
    }

    /// Applies the stored cursors onto a freshly built deck.
    pub fn apply(&self, deck: &mut Deck) -> AppResult<()> {
        deck.restore_cursors(&self.cursors)
    }

    /// Writes the snapshot to `path`, replacing any previous one.
    ///
    /// Goes through a sibling temp file and rename so a crash mid-write
    /// cannot leave a truncated snapshot behind.
    pub fn save(&self, path: &Path) -> AppResult<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        info!(path = %path.display(), "deck snapshot saved");
        Ok(())
    }

    /// Loads a snapshot, or `None` when no file exists yet.
    pub fn load(path: &Path) -> AppResult<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path)?;
        let snapshot: Self = serde_json::from_slice(&bytes)?;
        info!(path = %path.display(), saved_at = %snapshot.saved_at, "deck snapshot restored");
        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{DipPolicy, PlateGeometry, PlateKind};

    fn deck() -> Deck {
        let mut deck = Deck::new();
        deck.register_plate(
            "tips",
            Coordinate::new(100.0, 50.25, 30.5),
            PlateKind::Tipbox,
            PlateGeometry {
                rows: 8,
                cols: 12,
                spacing_row: 9.0,
                spacing_col: 9.0,
            },
            DipPolicy::Constant { depth: 60.0 },
        )
        .unwrap();
        deck
    }

    #[test]
    fn snapshot_round_trips_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deck.json");

        let mut deck = deck();
        for _ in 0..17 {
            deck.next_slot("tips").unwrap();
        }
        let snapshot =
            DeckSnapshot::capture(&deck, Some(Coordinate::new(12.125, 0.1 + 0.2, 55.0)));
        snapshot.save(&path).unwrap();

        let loaded = DeckSnapshot::load(&path).unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        assert_eq!(loaded.cursors.get("tips"), Some(&17));
        // Floats survive bit-exact, including the 0.1 + 0.2 artifact.
        assert_eq!(loaded.last_position, Some(Coordinate::new(12.125, 0.30000000000000004, 55.0)));
    }

    #[test]
    fn missing_file_means_fresh_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        assert!(DeckSnapshot::load(&path).unwrap().is_none());
    }

    #[test]
    fn restore_skips_unknown_plates() {
        let mut cursors = BTreeMap::new();
        cursors.insert("gone".to_string(), 5usize);
        cursors.insert("tips".to_string(), 3usize);
        let snapshot = DeckSnapshot {
            cursors,
            last_position: None,
            saved_at: Utc::now(),
        };
        let mut deck = deck();
        snapshot.apply(&mut deck).unwrap();
        assert_eq!(deck.cursors().get("tips"), Some(&3));
    }
}
