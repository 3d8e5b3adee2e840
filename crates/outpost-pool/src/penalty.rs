//! Failure accounting and the penalty box.
//!
//! The pool counts connects and errors per relay URL. A relay that has never
//! connected and keeps failing is put in the penalty box, which removes it
//! from outbox routing until it is released.

use std::collections::{BTreeSet, HashMap};

use outpost_core::CanonicalRelayUrl;

/// Relays excluded from outbox routing because of poor reliability.
#[derive(Debug, Clone, Default)]
pub struct PenaltyBox {
    relays: BTreeSet<CanonicalRelayUrl>,
}

impl PenaltyBox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the relay was not boxed before.
    pub fn insert(&mut self, url: CanonicalRelayUrl) -> bool {
        self.relays.insert(url)
    }

    /// Returns true if the relay was boxed.
    pub fn remove(&mut self, url: &CanonicalRelayUrl) -> bool {
        self.relays.remove(url)
    }

    pub fn contains(&self, url: &CanonicalRelayUrl) -> bool {
        self.relays.contains(url)
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CanonicalRelayUrl> {
        self.relays.iter()
    }
}

/// Connection statistics for one relay URL, across all partitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayConnectionStats {
    /// Successful handshakes.
    pub connects: u64,
    /// Failed handshakes plus socket errors.
    pub errors: u64,
    /// Errors since the last successful handshake.
    pub consecutive_errors: u64,
    /// Frames received.
    pub messages: u64,
    pub last_error: Option<String>,
}

/// Per-relay statistics, keyed by canonical URL.
#[derive(Debug, Default)]
pub struct StatsBook {
    stats: HashMap<CanonicalRelayUrl, RelayConnectionStats>,
}

impl StatsBook {
    pub fn record_connect(&mut self, url: &CanonicalRelayUrl) {
        let stats = self.entry(url);
        stats.connects += 1;
        stats.consecutive_errors = 0;
    }

    pub fn record_error(&mut self, url: &CanonicalRelayUrl, error: &str) -> &RelayConnectionStats {
        let stats = self.entry(url);
        stats.errors += 1;
        stats.consecutive_errors += 1;
        stats.last_error = Some(error.to_string());
        stats
    }

    pub fn record_message(&mut self, url: &CanonicalRelayUrl) {
        self.entry(url).messages += 1;
    }

    pub fn get(&self, url: &CanonicalRelayUrl) -> Option<&RelayConnectionStats> {
        self.stats.get(url)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CanonicalRelayUrl, &RelayConnectionStats)> {
        self.stats.iter()
    }

    /// Drop stats for relays `keep` rejects. Returns how many were dropped.
    pub fn retain(&mut self, mut keep: impl FnMut(&CanonicalRelayUrl) -> bool) -> usize {
        let before = self.stats.len();
        self.stats.retain(|url, _| keep(url));
        before - self.stats.len()
    }

    fn entry(&mut self, url: &CanonicalRelayUrl) -> &mut RelayConnectionStats {
        self.stats.entry(url.clone()).or_default()
    }
}

/// When a relay earns a place in the penalty box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PenaltyPolicy {
    /// Consecutive errors required, with no successful connect ever.
    pub min_errors: u64,
}

impl Default for PenaltyPolicy {
    fn default() -> Self {
        Self { min_errors: 3 }
    }
}

impl PenaltyPolicy {
    pub fn new(min_errors: u64) -> Self {
        Self { min_errors }
    }

    /// Relays from the user's own set are never penalized.
    pub fn should_penalize(&self, stats: &RelayConnectionStats, is_own_relay: bool) -> bool {
        !is_own_relay && stats.connects == 0 && stats.consecutive_errors >= self.min_errors
    }
}
