//! Subscriber reference counting and update-interval negotiation.

use std::collections::HashMap;

use crate::error::{ProviderError, Result};

/// The shortest interval at which the position is recalculated.
pub const MINIMUM_INTERVAL_MS: u32 = 10_000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscriber {
    pub reference_count: u32,
    /// Requested interval in milliseconds, 0 means no preference
    pub update_interval: u32,
}

/// Active subscribers keyed by their transport identity
#[derive(Debug, Default)]
pub struct SessionTable {
    subscribers: HashMap<String, Subscriber>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a reference for `caller`. Returns true if the table was empty before.
    pub fn add_reference(&mut self, caller: &str) -> bool {
        let was_empty = self.subscribers.is_empty();
        self.subscribers
            .entry(caller.to_string())
            .or_default()
            .reference_count += 1;
        was_empty
    }

    /// Drop one reference for `caller`, removing the entry at zero.
    pub fn remove_reference(&mut self, caller: &str) {
        let Some(subscriber) = self.subscribers.get_mut(caller) else {
            return;
        };
        subscriber.reference_count = subscriber.reference_count.saturating_sub(1);
        if subscriber.reference_count == 0 {
            self.subscribers.remove(caller);
        }
    }

    /// Forget `caller` entirely. Returns true if it had an entry.
    pub fn disconnect(&mut self, caller: &str) -> bool {
        self.subscribers.remove(caller).is_some()
    }

    pub fn set_update_interval(&mut self, caller: &str, interval_ms: u32) -> Result<()> {
        let subscriber = self
            .subscribers
            .get_mut(caller)
            .ok_or_else(|| ProviderError::NotSubscribed(caller.to_string()))?;
        subscriber.update_interval = interval_ms;
        Ok(())
    }

    /// Smallest requested interval, floored at [`MINIMUM_INTERVAL_MS`].
    pub fn effective_interval(&self) -> u32 {
        self.subscribers
            .values()
            .filter(|s| s.reference_count > 0 && s.update_interval > 0)
            .map(|s| s.update_interval)
            .min()
            .map_or(MINIMUM_INTERVAL_MS, |interval| interval.max(MINIMUM_INTERVAL_MS))
    }

    pub fn contains(&self, caller: &str) -> bool {
        self.subscribers.contains_key(caller)
    }

    pub fn get(&self, caller: &str) -> Option<&Subscriber> {
        self.subscribers.get(caller)
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }
}
