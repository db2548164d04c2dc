//! Decides which fix to hold as current.
//!
//! A fresh accurate fix beats a newer but worse one until it is older than
//! [`FALLBACK_INTERVAL_MS`]; after that any new fix wins.

use cellfix_common::Fix;

/// A held fix younger than this is re-emitted instead of recomputed.
pub const REUSE_INTERVAL_MS: i64 = 30_000;

/// A held fix younger than this can supersede a less accurate new one.
pub const FALLBACK_INTERVAL_MS: i64 = 120_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arbitration {
    /// The candidate becomes the current fix
    Adopt,
    /// The current fix is kept and re-emitted
    Retain,
}

pub fn arbitrate(current: &Fix, candidate: &Fix, now_millis: i64) -> Arbitration {
    if !current.is_valid() {
        return Arbitration::Adopt;
    }

    if current.age_millis(now_millis) >= FALLBACK_INTERVAL_MS {
        return Arbitration::Adopt;
    }

    // Smaller value means more accurate. Ties go to the candidate.
    if current.accuracy.horizontal < candidate.accuracy.horizontal {
        Arbitration::Retain
    } else {
        Arbitration::Adopt
    }
}

/// Whether a recompute tick should calculate a new position or re-emit the held one.
pub fn should_recompute(current: &Fix, now_millis: i64, change_pending: bool) -> bool {
    !current.is_valid() || current.age_millis(now_millis) > REUSE_INTERVAL_MS || change_pending
}
