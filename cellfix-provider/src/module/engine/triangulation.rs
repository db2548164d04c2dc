//! Signal-strength weighted centroid of the resolved cells.
//!
//! This is not multilateration. The device is placed at the centroid of the
//! known cell sites, each weighted by its share of the total signal strength,
//! and the accuracy estimate only depends on how many cells corroborate it.

use cellfix_common::{CellIdentity, Coordinates, Fix};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Manual cell-based triangulation is error-prone, never claim better than this.
pub const MINIMUM_CALCULATED_ACCURACY: f64 = 2500.0;

/// How to weight cells when none of them reported a signal strength
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZeroSignalPolicy {
    /// Every weight is 0, placing the fix at latitude 0, longitude 0
    #[default]
    Origin,
    /// Plain unweighted centroid
    EqualWeight,
}

/// A visible cell whose location is known
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedCell {
    pub identity: CellIdentity,
    pub coordinates: Coordinates,
    pub signal_strength: u32,
}

/// Heuristic horizontal accuracy in meters for `count` corroborating cells
pub fn estimated_accuracy(count: usize) -> f64 {
    let estimate = 10_000.0 - 1_000.0 * count as f64;
    estimate.max(MINIMUM_CALCULATED_ACCURACY)
}

/// Estimate a fix from the resolved cells. Returns `None` when there is nothing to work with.
pub fn estimate(cells: &[ResolvedCell], policy: ZeroSignalPolicy, now_millis: i64) -> Option<Fix> {
    match cells.len() {
        0 => {
            debug!("No cell id data to calculate position from");
            return None;
        }
        1 => debug!("Only one cell id datum to calculate position from, position will be extremely inaccurate"),
        2 => debug!("Only two cell id data to calculate position from, position will be highly inaccurate"),
        n => debug!("Calculating position from {} cell id data", n),
    }

    let total_strength: f64 = cells.iter().map(|c| c.signal_strength as f64).sum();
    let equal_weight = 1.0 / cells.len() as f64;

    let mut latitude = 0.0;
    let mut longitude = 0.0;
    for cell in cells {
        let weight = if total_strength > 0.0 {
            cell.signal_strength as f64 / total_strength
        } else {
            match policy {
                ZeroSignalPolicy::Origin => 0.0,
                ZeroSignalPolicy::EqualWeight => equal_weight,
            }
        };
        latitude += weight * cell.coordinates.latitude;
        longitude += weight * cell.coordinates.longitude;

        debug!(
            "Have cell {} at {}, {} with weight {:.3}",
            cell.identity, cell.coordinates.latitude, cell.coordinates.longitude, weight
        );
    }

    Some(Fix::new(
        now_millis,
        latitude,
        longitude,
        estimated_accuracy(cells.len()),
    ))
}
