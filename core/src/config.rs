//! Recurrence configuration: band width and readout coordinate.
//!
//! Serializable so a demo run or a benchmark sweep can be described in a
//! JSON file and reproduced exactly.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::banded::BandedOperator;
use crate::error::{BandError, Result};

/// Structural settings of one recurrence objective.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecurrenceConfig {
    /// Band half-width `m`, inclusive of the diagonal.
    pub band_width: usize,
    /// Coordinate of the final state reported as the scalar objective.
    pub readout: usize,
}

impl Default for RecurrenceConfig {
    fn default() -> Self {
        RecurrenceConfig { band_width: 2, readout: 0 }
    }
}

impl RecurrenceConfig {
    pub fn new(band_width: usize) -> Self {
        RecurrenceConfig { band_width, ..Default::default() }
    }

    pub fn with_readout(mut self, readout: usize) -> Self {
        self.readout = readout;
        self
    }

    /// Check the settings against a state dimension `n`.
    pub fn validate(&self, n: usize) -> Result<()> {
        if self.band_width < 1 {
            return Err(BandError::InvalidBandWidth { m: self.band_width });
        }
        if n < 1 {
            return Err(BandError::InvalidStateDim { n });
        }
        if self.readout >= n {
            return Err(BandError::ReadoutOutOfRange { index: self.readout, n });
        }
        Ok(())
    }

    /// Validate and build the operator for dimension `n`.
    pub fn operator(&self, n: usize) -> Result<BandedOperator> {
        self.validate(n)?;
        BandedOperator::new(self.band_width, n)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| BandError::Config(e.to_string()))
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| BandError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| BandError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = self.to_json_string()?;
        std::fs::write(path, json)
            .map_err(|e| BandError::Config(format!("{}: {e}", path.display())))
    }
}
