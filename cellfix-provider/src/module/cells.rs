//! Visible cells as reported by the modem.
//!
//! The modem helper writes the neighbour cell list to a JSON snapshot file:
//!
//! ```json
//! [
//!   {"type": "lte", "mcc": 244, "mnc": 91, "tac": 4031, "ci": 26880003, "signal_strength": 31},
//!   {"type": "gsm", "mcc": 244, "mnc": 91, "lac": 1021, "cid": 4211, "signal_strength": 12}
//! ]
//! ```

use cellfix_common::{CellIdentity, CellObservation, CellType};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Provides the cells currently visible to the modem
pub trait CellSource: Send {
    fn observations(&self) -> Vec<CellObservation>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawCellKind {
    Gsm,
    Wcdma,
    Lte,
    #[serde(other)]
    Unknown,
}

/// A neighbour cell exactly as the modem reports it; absent values are `None`
#[derive(Debug, Clone, Deserialize)]
pub struct RawCell {
    #[serde(rename = "type")]
    pub kind: RawCellKind,
    #[serde(default)]
    pub mcc: Option<u16>,
    #[serde(default)]
    pub mnc: Option<u16>,
    #[serde(default)]
    pub lac: Option<u32>,
    #[serde(default)]
    pub cid: Option<u32>,
    #[serde(default)]
    pub tac: Option<u32>,
    #[serde(default)]
    pub ci: Option<u32>,
    #[serde(default)]
    pub signal_strength: u32,
}

impl RawCell {
    fn cell_type(&self) -> CellType {
        match self.kind {
            RawCellKind::Gsm => CellType::Gsm,
            RawCellKind::Lte => CellType::Lte,
            RawCellKind::Wcdma | RawCellKind::Unknown => CellType::Umts,
        }
    }

    /// Build the unique identity, preferring (lac, cid) over (tac, ci).
    pub fn identity(&self) -> Option<CellIdentity> {
        let mcc = self.mcc.unwrap_or(0);
        if mcc == 0 {
            return None;
        }
        let mnc = self.mnc.unwrap_or(0);

        let (location_code, cell_id) = match (self.cid, self.ci) {
            (Some(cid), _) if cid != 0 => (self.lac.unwrap_or(0), cid),
            (_, Some(ci)) if ci != 0 => (self.tac.unwrap_or(0), ci),
            _ => return None,
        };

        Some(CellIdentity::new(self.cell_type(), cell_id, location_code, mcc, mnc))
    }
}

/// Turn raw modem cells into observations, dropping cells without an id and duplicates.
pub fn normalize(raw_cells: &[RawCell]) -> Vec<CellObservation> {
    debug!("Have {} neighbouring cells", raw_cells.len());

    let mut seen = HashSet::new();
    let mut observations = Vec::with_capacity(raw_cells.len());
    for raw in raw_cells {
        let Some(identity) = raw.identity() else {
            debug!(
                "Ignoring neighbour cell with no cell id: type {:?}, mcc {:?}, mnc {:?}, lac {:?}, tac {:?}",
                raw.kind, raw.mcc, raw.mnc, raw.lac, raw.tac
            );
            continue;
        };

        if seen.insert(identity) {
            debug!("Have neighbour cell {} with strength {}", identity, raw.signal_strength);
            observations.push(CellObservation::new(identity, raw.signal_strength));
        }
    }
    observations
}

/// Reads the modem helper's JSON snapshot on every call
pub struct SnapshotCellSource {
    path: PathBuf,
}

impl SnapshotCellSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn read_raw(&self) -> anyhow::Result<Vec<RawCell>> {
        let content = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl CellSource for SnapshotCellSource {
    fn observations(&self) -> Vec<CellObservation> {
        match self.read_raw() {
            Ok(raw) => normalize(&raw),
            Err(e) => {
                warn!("Cannot read cell snapshot {:?}: {}", self.path, e);
                Vec::new()
            }
        }
    }
}
