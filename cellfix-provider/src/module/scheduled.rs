//! Timer manager - named, re-armable timers feeding the service queue
//!
//! One task per armed timer:
//! - Idle (one-shot, quits the service)
//! - FixLost (one-shot, demotes the status)
//! - Recompute (repeating, at the negotiated interval)
//!
//! Firings carry a generation number. A firing that was already queued
//! when its timer got re-armed or cancelled no longer matches and is dropped.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::engine::TimerKind;
use crate::service::Event;

struct ArmedTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Timer manager owned by the service loop
pub struct Scheduler {
    events: mpsc::UnboundedSender<Event>,
    timers: HashMap<TimerKind, ArmedTimer>,
    next_generation: u64,
}

impl Scheduler {
    pub fn new(events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            events,
            timers: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Arm `timer`, replacing any earlier arming of the same kind
    pub fn arm(&mut self, timer: TimerKind, after: Duration) {
        self.cancel(timer);

        self.next_generation += 1;
        let generation = self.next_generation;
        let events = self.events.clone();

        let handle = if timer.repeats() {
            let period = after.max(Duration::from_millis(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if events.send(Event::Timer { timer, generation }).is_err() {
                        break;
                    }
                }
            })
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                let _ = events.send(Event::Timer { timer, generation });
            })
        };

        tracing::debug!("Armed {:?} timer for {:.1}s", timer, after.as_secs_f64());
        self.timers.insert(timer, ArmedTimer { generation, handle });
    }

    pub fn cancel(&mut self, timer: TimerKind) {
        if let Some(armed) = self.timers.remove(&timer) {
            armed.handle.abort();
            tracing::debug!("Cancelled {:?} timer", timer);
        }
    }

    /// Whether a firing belongs to the current arming. Fired one-shot timers are forgotten.
    pub fn accept(&mut self, timer: TimerKind, generation: u64) -> bool {
        match self.timers.get(&timer) {
            Some(armed) if armed.generation == generation => {
                if !timer.repeats() {
                    self.timers.remove(&timer);
                }
                true
            }
            _ => {
                tracing::debug!("Dropping stale {:?} timer firing (generation {})", timer, generation);
                false
            }
        }
    }

    pub fn is_armed(&self, timer: TimerKind) -> bool {
        self.timers.contains_key(&timer)
    }

    /// Stop all timers
    pub fn shutdown(&mut self) {
        for (_, armed) in self.timers.drain() {
            armed.handle.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
