//! Offline cell location dataset.
//!
//! Each dataset directory is split into buckets by the first digit of the
//! location area code, so only one small file is scanned per lookup:
//!
//! ```text
//! <dir>/1/cells.csv
//! <dir>/2/cells.csv
//! ...
//! ```
//!
//! Every bucket is a CSV file with the header `radio,mcc,mnc,lac,cid,lat,lon`.

use cellfix_common::{CellIdentity, CellType, Coordinates};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::engine::CellLocator;

const BUCKET_FILE: &str = "cells.csv";

#[derive(Debug, Deserialize)]
struct DatasetRow {
    radio: String,
    mcc: u16,
    mnc: u16,
    lac: u32,
    cid: u32,
    lat: f64,
    lon: f64,
}

impl DatasetRow {
    fn identity(&self) -> Option<CellIdentity> {
        let cell_type: CellType = self.radio.parse().ok()?;
        Some(CellIdentity::new(cell_type, self.cid, self.lac, self.mcc, self.mnc))
    }

    fn coordinates(&self) -> Option<Coordinates> {
        let valid = self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon);
        valid.then(|| Coordinates::new(self.lat, self.lon))
    }
}

/// CSV-backed dataset spread over one or more directories, searched in order
pub struct CsvDataset {
    dirs: Vec<PathBuf>,
}

impl CsvDataset {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    fn bucket_name(location_code: u32) -> String {
        location_code.to_string().chars().take(1).collect()
    }

    fn search_bucket(path: &Path, identity: &CellIdentity) -> Option<Coordinates> {
        let mut reader = match csv::Reader::from_path(path) {
            Ok(reader) => reader,
            Err(e) => {
                warn!("Cannot open dataset file {:?}: {}", path, e);
                return None;
            }
        };

        let mut rows = 0usize;
        for record in reader.deserialize::<DatasetRow>() {
            let row = match record {
                Ok(row) => row,
                Err(e) => {
                    debug!("Skipping malformed row in {:?}: {}", path, e);
                    continue;
                }
            };
            rows += 1;

            if row.identity().as_ref() != Some(identity) {
                continue;
            }

            match row.coordinates() {
                Some(coords) => {
                    debug!(
                        "Dataset file {:?} contains the location of cell {}: {}, {}",
                        path, identity, coords.latitude, coords.longitude
                    );
                    return Some(coords);
                }
                None => debug!("Skipping out-of-range coordinates for cell {} in {:?}", identity, path),
            }
        }

        debug!("Dataset file {:?} contains {} cell locations, but not for {}", path, rows, identity);
        None
    }
}

impl CellLocator for CsvDataset {
    fn lookup(&self, identity: &CellIdentity) -> Option<Coordinates> {
        let bucket = Self::bucket_name(identity.location_code);

        for dir in &self.dirs {
            let path = dir.join(&bucket).join(BUCKET_FILE);
            if !path.exists() {
                continue;
            }
            if let Some(coords) = Self::search_bucket(&path, identity) {
                return Some(coords);
            }
        }

        debug!("No dataset file contains the location of cell {}", identity);
        None
    }
}
