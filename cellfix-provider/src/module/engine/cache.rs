//! Two-tier cell location cache.
//!
//! Cell towers do not move, so a resolution is never invalidated: a cell is
//! either known (positive map) or known to be unresolvable (negative set)
//! for the rest of the process lifetime.

use cellfix_common::{CellIdentity, Coordinates};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Source of reference coordinates for cells the cache has not seen yet
pub trait CellLocator: Send {
    fn lookup(&self, identity: &CellIdentity) -> Option<Coordinates>;
}

/// Cache counters for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatistics {
    pub known: usize,
    pub unknown: usize,
    pub hits: u64,
    pub lookups: u64,
}

pub struct CellLocationCache {
    locator: Box<dyn CellLocator>,
    known: HashMap<CellIdentity, Coordinates>,
    unknown: HashSet<CellIdentity>,
    hits: u64,
    lookups: u64,
}

impl CellLocationCache {
    pub fn new(locator: Box<dyn CellLocator>) -> Self {
        Self {
            locator,
            known: HashMap::new(),
            unknown: HashSet::new(),
            hits: 0,
            lookups: 0,
        }
    }

    /// Resolve a cell to its coordinates, consulting the locator at most once per cell.
    pub fn resolve(&mut self, identity: &CellIdentity) -> Option<Coordinates> {
        if let Some(coords) = self.known.get(identity) {
            self.hits += 1;
            return Some(*coords);
        }

        if self.unknown.contains(identity) {
            self.hits += 1;
            return None;
        }

        self.lookups += 1;
        match self.locator.lookup(identity) {
            Some(coords) => {
                debug!(
                    "Cached location of cell {}: {}, {}",
                    identity, coords.latitude, coords.longitude
                );
                self.known.insert(*identity, coords);
                Some(coords)
            }
            None => {
                debug!("Cell {} has no known location", identity);
                self.unknown.insert(*identity);
                None
            }
        }
    }

    pub fn is_known(&self, identity: &CellIdentity) -> bool {
        self.known.contains_key(identity)
    }

    pub fn is_unknown(&self, identity: &CellIdentity) -> bool {
        self.unknown.contains(identity)
    }

    pub fn statistics(&self) -> CacheStatistics {
        CacheStatistics {
            known: self.known.len(),
            unknown: self.unknown.len(),
            hits: self.hits,
            lookups: self.lookups,
        }
    }
}
