//! Pool configuration.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use outpost_core::CanonicalRelayUrl;
use outpost_core::relay_list::DEFAULT_MAX_RELAYS_PER_LIST;

use crate::{Error, Result};

/// Relays that are not meant for general content discovery.
pub const SPECIAL_PURPOSE_RELAYS: &[&str] = &[
    "wss://nostr.mutinywallet.com",
    "wss://filter.nostr.wine",
    "wss://purplepag.es",
];

/// Relays so widely used that they are assumed to be covered by everyone's own relay set.
pub const POPULAR_RELAYS: &[&str] = &[
    "wss://nos.lol",
    "wss://nostr.wine",
    "wss://relay.damus.io",
    "wss://relay.primal.net",
    "wss://relay.nostr.band",
];

/// Configuration for a [`RelayPool`](crate::RelayPool).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Route REQs and EVENTs through other people's relays (NIP-65 outbox model).
    pub outbox_enabled: bool,

    /// Low data mode: never open outbox connections.
    pub low_data_mode: bool,

    /// Upper bound on relays in a single outbox plan.
    pub max_preferred_relays: usize,

    /// Number of most-declared relays skipped when planning a find.
    ///
    /// Those relays are almost always in our own read set already.
    pub skip_top_relays: usize,

    /// Relay lists declaring more relays than this are dropped entirely.
    pub max_relays_per_list: usize,

    /// Relays never used for outbox routing because they serve a special purpose.
    pub special_purpose_relays: Vec<String>,

    /// Relays never used for outbox routing because everybody uses them already.
    pub popular_relays: Vec<String>,

    /// Event kinds whose p-tags are not mentions and must not trigger reach expansion.
    ///
    /// Default: 3 (contact list) and 10000 (mute list).
    pub reach_excluded_kinds: HashSet<u16>,

    /// Keepalive tick interval.
    pub keepalive_interval: Duration,

    /// Ping a connected relay after this much silence.
    pub ping_after: Duration,

    /// Drop a connected relay after this much silence, so the next tick reconnects it.
    pub stale_after: Duration,

    /// Lifetime of ephemeral connections.
    pub ephemeral_ttl: Duration,

    /// Outbox connections without subscriptions or traffic for this long are removed.
    pub outbox_idle_after: Duration,

    /// Websocket handshake timeout.
    pub connect_timeout: Duration,

    /// First reconnect delay after a failed handshake; doubles per failure.
    pub backoff_base: Duration,

    /// Cap on the reconnect delay.
    pub backoff_max: Duration,

    /// Errors (with zero successful connects) before a relay enters the penalty box.
    pub penalty_min_errors: u64,

    /// Refuse ephemeral connections unless a VPN has been reported.
    pub vpn_guard: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            outbox_enabled: true,
            low_data_mode: false,
            max_preferred_relays: 50,
            skip_top_relays: 3,
            max_relays_per_list: DEFAULT_MAX_RELAYS_PER_LIST,
            special_purpose_relays: SPECIAL_PURPOSE_RELAYS.iter().map(|s| s.to_string()).collect(),
            popular_relays: POPULAR_RELAYS.iter().map(|s| s.to_string()).collect(),
            reach_excluded_kinds: HashSet::from([3, 10000]),
            keepalive_interval: Duration::from_secs(30),
            ping_after: Duration::from_secs(45),
            stale_after: Duration::from_secs(120),
            ephemeral_ttl: Duration::from_secs(35),
            outbox_idle_after: Duration::from_secs(600),
            connect_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(300),
            penalty_min_errors: 3,
            vpn_guard: false,
        }
    }
}

impl PoolConfig {
    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// Optional:
    /// - `OUTPOST_OUTBOX_ENABLED`: true/false (default: true)
    /// - `OUTPOST_LOW_DATA_MODE`: true/false (default: false)
    /// - `OUTPOST_MAX_PREFERRED_RELAYS`: default 50
    /// - `OUTPOST_SKIP_TOP_RELAYS`: default 3
    /// - `OUTPOST_MAX_RELAYS_PER_LIST`: default 20
    /// - `OUTPOST_SPECIAL_PURPOSE_RELAYS`: comma-separated URLs
    /// - `OUTPOST_POPULAR_RELAYS`: comma-separated URLs
    /// - `OUTPOST_KEEPALIVE_SECS`: default 30
    /// - `OUTPOST_EPHEMERAL_TTL_SECS`: default 35
    /// - `OUTPOST_OUTBOX_IDLE_SECS`: default 600
    /// - `OUTPOST_CONNECT_TIMEOUT_SECS`: default 10
    /// - `OUTPOST_PENALTY_MIN_ERRORS`: default 3
    /// - `OUTPOST_VPN_GUARD`: true/false (default: false)
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = env_parse("OUTPOST_OUTBOX_ENABLED")? {
            config.outbox_enabled = v;
        }
        if let Some(v) = env_parse("OUTPOST_LOW_DATA_MODE")? {
            config.low_data_mode = v;
        }
        if let Some(v) = env_parse("OUTPOST_MAX_PREFERRED_RELAYS")? {
            config.max_preferred_relays = v;
        }
        if let Some(v) = env_parse("OUTPOST_SKIP_TOP_RELAYS")? {
            config.skip_top_relays = v;
        }
        if let Some(v) = env_parse("OUTPOST_MAX_RELAYS_PER_LIST")? {
            config.max_relays_per_list = v;
        }
        if let Some(v) = env_list("OUTPOST_SPECIAL_PURPOSE_RELAYS") {
            config.special_purpose_relays = v;
        }
        if let Some(v) = env_list("OUTPOST_POPULAR_RELAYS") {
            config.popular_relays = v;
        }
        if let Some(secs) = env_parse("OUTPOST_KEEPALIVE_SECS")? {
            config.keepalive_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("OUTPOST_EPHEMERAL_TTL_SECS")? {
            config.ephemeral_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("OUTPOST_OUTBOX_IDLE_SECS")? {
            config.outbox_idle_after = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("OUTPOST_CONNECT_TIMEOUT_SECS")? {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(v) = env_parse("OUTPOST_PENALTY_MIN_ERRORS")? {
            config.penalty_min_errors = v;
        }
        if let Some(v) = env_parse("OUTPOST_VPN_GUARD")? {
            config.vpn_guard = v;
        }

        config.validate()?;

        tracing::info!(
            outbox_enabled = config.outbox_enabled,
            low_data_mode = config.low_data_mode,
            max_preferred_relays = config.max_preferred_relays,
            skip_top_relays = config.skip_top_relays,
            "pool configuration loaded"
        );

        Ok(config)
    }

    /// Check invariants between fields.
    pub fn validate(&self) -> Result<()> {
        if self.keepalive_interval.is_zero() {
            return Err(Error::Config("keepalive interval must be non-zero".to_string()));
        }
        if self.stale_after <= self.ping_after {
            return Err(Error::Config(format!(
                "stale_after ({:?}) must exceed ping_after ({:?})",
                self.stale_after, self.ping_after
            )));
        }
        if self.backoff_max < self.backoff_base {
            return Err(Error::Config("backoff_max must be >= backoff_base".to_string()));
        }
        self.deny_list()?;
        Ok(())
    }

    /// Special-purpose and popular relays, canonicalized.
    pub fn deny_list(&self) -> Result<HashSet<CanonicalRelayUrl>> {
        self.special_purpose_relays
            .iter()
            .chain(self.popular_relays.iter())
            .map(|url| CanonicalRelayUrl::parse(url).map_err(Error::from))
            .collect()
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} has invalid value '{}'", key, raw))),
        Err(_) => Ok(None),
    }
}

fn env_list(key: &str) -> Option<Vec<String>> {
    std::env::var(key).ok().map(|raw| {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}
