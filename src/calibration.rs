//! Volume-to-actuation calibration.
//!
//! Maps a requested liquid volume in microliters to a plunger stepper
//! displacement. Calibration data comes in as raw `(nominal, volume, steps)`
//! samples recorded per device profile; samples sharing a declared nominal
//! target form a *bin*, and each bin is collapsed to the arithmetic mean of
//! its step values at load time. Lookups interpolate linearly between
//! adjacent bin means, so the dose-response stays continuous across bin
//! boundaries (nearest-bin lookup would not).
//!
//! The table is immutable after construction; `vol_to_steps` is a pure
//! function of the loaded data. Volumes outside the calibrated range are a
//! hard [`PipetteError::VolumeOutOfRange`], never clamped.

use crate::error::{AppResult, PipetteError};
use serde::{Deserialize, Serialize};

/// One raw calibration measurement, as recorded in a device profile.
///
/// `nominal` is the target dose the sample was measured against; samples
/// with the same nominal are averaged into a single bin. `volume` is the
/// gravimetrically measured volume and is kept for provenance.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSample {
    /// Declared target volume for this measurement, in uL.
    pub nominal: f64,
    /// Measured delivered volume, in uL.
    pub volume: f64,
    /// Plunger displacement used, in stepper steps.
    pub steps: f64,
}

/// A group of samples collapsed to one representative point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CalibrationBin {
    /// Nominal volume this bin represents, in uL.
    pub volume: f64,
    /// Mean step value of the bin's samples.
    pub steps: f64,
    /// Number of samples averaged into this bin.
    pub samples: usize,
}

/// Immutable volume-to-steps lookup table for one pipette profile.
#[derive(Clone, Debug)]
pub struct CalibrationTable {
    bins: Vec<CalibrationBin>,
    max_vol: f64,
    dispense_steps: f64,
}

impl CalibrationTable {
    /// Builds a table from raw samples, grouping by declared nominal volume.
    ///
    /// Bins come out sorted ascending by nominal volume. `max_vol` is the
    /// largest volume a single transfer may request; `dispense_steps` is the
    /// fixed extra displacement used to clear the tip when dispensing.
    pub fn from_samples(
        samples: &[CalibrationSample],
        max_vol: f64,
        dispense_steps: f64,
    ) -> AppResult<Self> {
        if samples.is_empty() {
            return Err(PipetteError::Configuration(
                "calibration table has no samples".into(),
            ));
        }
        if !max_vol.is_finite() || max_vol <= 0.0 {
            return Err(PipetteError::Configuration(format!(
                "max_vol must be positive, got {max_vol}"
            )));
        }

        let mut sorted: Vec<CalibrationSample> = samples.to_vec();
        sorted.sort_by(|a, b| a.nominal.total_cmp(&b.nominal));

        let mut bins: Vec<CalibrationBin> = Vec::new();
        for sample in &sorted {
            if !sample.nominal.is_finite() || sample.nominal <= 0.0 {
                return Err(PipetteError::Configuration(format!(
                    "calibration sample has non-positive nominal volume {}",
                    sample.nominal
                )));
            }
            match bins.last_mut() {
                Some(bin) if bin.volume == sample.nominal => {
                    // Running mean keeps this a single pass over the samples.
                    bin.steps += (sample.steps - bin.steps) / (bin.samples as f64 + 1.0);
                    bin.samples += 1;
                }
                _ => bins.push(CalibrationBin {
                    volume: sample.nominal,
                    steps: sample.steps,
                    samples: 1,
                }),
            }
        }

        if let Some(last) = bins.last() {
            if max_vol < last.volume {
                return Err(PipetteError::Configuration(format!(
                    "max_vol {} uL is below the largest calibration bin ({} uL)",
                    max_vol, last.volume
                )));
            }
        }

        Ok(Self {
            bins,
            max_vol,
            dispense_steps,
        })
    }

    /// Builds a table from pre-averaged `(volume, steps)` pairs.
    pub fn from_bins(points: &[(f64, f64)], max_vol: f64, dispense_steps: f64) -> AppResult<Self> {
        let samples: Vec<CalibrationSample> = points
            .iter()
            .map(|&(volume, steps)| CalibrationSample {
                nominal: volume,
                volume,
                steps,
            })
            .collect();
        Self::from_samples(&samples, max_vol, dispense_steps)
    }

    /// Largest volume a single transfer may request, in uL.
    pub fn max_vol(&self) -> f64 {
        self.max_vol
    }

    /// Fixed displacement used to clear the tip when dispensing.
    pub fn dispense_steps(&self) -> f64 {
        self.dispense_steps
    }

    /// The averaged bins, ascending by nominal volume.
    pub fn bins(&self) -> &[CalibrationBin] {
        &self.bins
    }

    /// Converts a volume in uL to a plunger displacement in steps.
    ///
    /// Exact bin hits return the bin mean. Volumes between two bins
    /// interpolate linearly between the neighboring means; volumes above the
    /// last bin but within `max_vol` extend the last segment's slope.
    /// Volumes below the smallest bin or above `max_vol` fail with
    /// [`PipetteError::VolumeOutOfRange`].
    pub fn vol_to_steps(&self, vol_ul: f64) -> AppResult<f64> {
        if !vol_ul.is_finite() || vol_ul > self.max_vol {
            return Err(PipetteError::VolumeOutOfRange {
                requested: vol_ul,
                max: self.max_vol,
            });
        }

        // A single bin gives a constant response over the valid range.
        if self.bins.len() == 1 {
            if vol_ul <= 0.0 {
                return Err(PipetteError::VolumeOutOfRange {
                    requested: vol_ul,
                    max: self.max_vol,
                });
            }
            return Ok(self.bins[0].steps);
        }

        let first = &self.bins[0];
        if vol_ul < first.volume {
            return Err(PipetteError::VolumeOutOfRange {
                requested: vol_ul,
                max: self.max_vol,
            });
        }

        // Find the segment whose endpoints bracket the request.
        for pair in self.bins.windows(2) {
            let (lo, hi) = (&pair[0], &pair[1]);
            if vol_ul == lo.volume {
                return Ok(lo.steps);
            }
            if vol_ul < hi.volume {
                let t = (vol_ul - lo.volume) / (hi.volume - lo.volume);
                return Ok(lo.steps + t * (hi.steps - lo.steps));
            }
        }

        // At or past the last bin, still within max_vol: extend the final
        // segment so the last stretch of the range stays usable.
        let n = self.bins.len();
        let (lo, hi) = (&self.bins[n - 2], &self.bins[n - 1]);
        if vol_ul == hi.volume {
            return Ok(hi.steps);
        }
        let slope = (hi.steps - lo.steps) / (hi.volume - lo.volume);
        Ok(hi.steps + slope * (vol_ul - hi.volume))
    }
}
