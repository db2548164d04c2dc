//! Position fusion and availability engine.
//!
//! The engine is a synchronous state machine. It is fed events by the
//! service loop and answers with [`Action`]s (arm a timer, start an online
//! lookup, notify subscribers) that the loop carries out in order.

pub mod arbitration;
pub mod cache;
pub mod provider;
pub mod session;
pub mod status;
pub mod triangulation;

use std::time::Duration;

pub use arbitration::{Arbitration, FALLBACK_INTERVAL_MS, REUSE_INTERVAL_MS};
pub use cache::{CacheStatistics, CellLocationCache, CellLocator};
pub use provider::{Action, PositionEngine, TimerKind};
pub use session::{MINIMUM_INTERVAL_MS, SessionTable};
pub use status::StatusMachine;
pub use triangulation::{MINIMUM_CALCULATED_ACCURACY, ZeroSignalPolicy};

/// The service shuts down after this long without subscribers.
pub const QUIT_IDLE_TIME: Duration = Duration::from_secs(30);

/// Status drops from Available to Acquiring after this long without a new fix.
pub const FIX_TIMEOUT: Duration = Duration::from_secs(30);

/// Wall clock in milliseconds since the Unix epoch
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}
