//! Canonical relay URLs.
//!
//! Every map in the pool is keyed by a [`CanonicalRelayUrl`], so two spellings
//! of the same relay (`wss://Relay.Example.com/` and `wss://relay.example.com`)
//! always land on the same connection.
//!
//! # Normalization Rules
//!
//! - Trim surrounding whitespace
//! - Lowercase the whole URL
//! - Require a websocket scheme (wss:// or ws://)
//! - Validate the structure with nostr's `RelayUrl`
//! - Remove trailing slashes
//!
//! # Filtering Rules
//!
//! URLs learned from other people (relay lists, hints) additionally go through
//! [`normalize_relay_url`], which rejects hosts we never want to connect to:
//! - localhost, loopback and unspecified addresses
//! - Private IPv4 ranges, CGNAT and link-local addresses
//! - IPv6 loopback, link-local, unique local and IPv4-mapped addresses
//! - .onion addresses unless `allow_onion` is set
//! - .local addresses (mDNS)
//! - "umbrel" (common home server misconfiguration)

use std::fmt;
use std::net::IpAddr;

use nostr::RelayUrl;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A relay URL in canonical form, suitable as a map key.
///
/// Serializes as a plain string; deserializing canonicalizes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CanonicalRelayUrl(String);

impl CanonicalRelayUrl {
    /// Parse and canonicalize a relay URL without applying the host blocklist.
    ///
    /// Use this for relays the user configured explicitly. A user may well run
    /// a relay on their own LAN.
    pub fn parse(url: &str) -> Result<Self> {
        let lowered = url.trim().to_lowercase();

        if !lowered.starts_with("wss://") && !lowered.starts_with("ws://") {
            return Err(Error::InvalidRelayUrl {
                url: url.to_string(),
                reason: "URL must start with wss:// or ws://".to_string(),
            });
        }

        RelayUrl::parse(&lowered).map_err(|e| Error::InvalidRelayUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let canonical = lowered.trim_end_matches('/');
        if extract_host(canonical).is_empty() {
            return Err(Error::InvalidRelayUrl {
                url: url.to_string(),
                reason: "empty host".to_string(),
            });
        }

        Ok(Self(canonical.to_string()))
    }

    /// The canonical URL as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The host portion, including an explicit port if present.
    pub fn host(&self) -> &str {
        extract_host(&self.0)
    }
}

impl fmt::Display for CanonicalRelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CanonicalRelayUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for CanonicalRelayUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CanonicalRelayUrl {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<CanonicalRelayUrl> for String {
    fn from(url: CanonicalRelayUrl) -> Self {
        url.0
    }
}

#[derive(Debug, Clone, Default)]
pub struct NormalizeOptions {
    /// Accept Tor hidden services.
    pub allow_onion: bool,
}

/// Why a host is refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostBlock {
    Localhost,
    /// Loopback, private, CGNAT, link-local or otherwise reserved address.
    ReservedAddress(IpAddr),
    Onion,
    /// mDNS name.
    MdnsName,
    /// Umbrel home servers leak these into relay lists.
    Umbrel,
    HostTooShort,
}

impl fmt::Display for HostBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Localhost => f.write_str("localhost"),
            Self::ReservedAddress(ip) => write!(f, "reserved address {}", ip),
            Self::Onion => f.write_str("onion host"),
            Self::MdnsName => f.write_str("mDNS host"),
            Self::Umbrel => f.write_str("umbrel host"),
            Self::HostTooShort => f.write_str("host name too short"),
        }
    }
}

/// Outcome of [`normalize_relay_url`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizeResult {
    Ok(CanonicalRelayUrl),
    /// Not a websocket URL.
    Invalid(String),
    /// A websocket URL we refuse to connect to.
    Blocked(HostBlock),
}

impl NormalizeResult {
    pub fn ok(self) -> Option<CanonicalRelayUrl> {
        match self {
            Self::Ok(url) => Some(url),
            Self::Invalid(_) | Self::Blocked(_) => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

/// Canonicalize an untrusted relay URL (relay list entry, relay hint) and
/// apply the host blocklist.
pub fn normalize_relay_url(url: &str) -> NormalizeResult {
    normalize_relay_url_with_opts(url, &NormalizeOptions::default())
}

pub fn normalize_relay_url_with_opts(url: &str, opts: &NormalizeOptions) -> NormalizeResult {
    match CanonicalRelayUrl::parse(url) {
        Ok(canonical) => match blocked_host(canonical.host(), opts) {
            Some(block) => NormalizeResult::Blocked(block),
            None => NormalizeResult::Ok(canonical),
        },
        Err(Error::InvalidRelayUrl { reason, .. }) => NormalizeResult::Invalid(reason),
        Err(e) => NormalizeResult::Invalid(e.to_string()),
    }
}

fn blocked_host(host: &str, opts: &NormalizeOptions) -> Option<HostBlock> {
    let name = strip_port(host);
    let bare = name.trim_start_matches('[').trim_end_matches(']');

    if let Ok(ip) = bare.parse::<IpAddr>() {
        return is_private_ip(&ip).then_some(HostBlock::ReservedAddress(ip));
    }

    if name == "localhost" || name.ends_with(".localhost") {
        Some(HostBlock::Localhost)
    } else if name.ends_with(".onion") && !opts.allow_onion {
        Some(HostBlock::Onion)
    } else if name.ends_with(".local") {
        Some(HostBlock::MdnsName)
    } else if name.contains("umbrel") {
        Some(HostBlock::Umbrel)
    } else if name.len() < 3 {
        Some(HostBlock::HostTooShort)
    } else {
        None
    }
}

/// `host[:port]` part of a ws/wss URL.
fn extract_host(url: &str) -> &str {
    let rest = ["wss://", "ws://"]
        .iter()
        .find_map(|scheme| url.strip_prefix(scheme))
        .unwrap_or(url);
    match rest.find('/') {
        Some(slash) => &rest[..slash],
        None => rest,
    }
}

/// Host without `:port`. IPv6 literals keep their brackets.
fn strip_port(host: &str) -> &str {
    if let Some(close) = host.rfind(']') {
        return &host[..=close];
    }
    host.rsplit_once(':').map_or(host, |(name, _)| name)
}

/// Addresses that never host a public relay.
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            let cgnat = a == 100 && (64..=127).contains(&b);
            let reserved = a >= 240;
            v4.is_loopback()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_link_local()
                || v4.is_private()
                || v4.is_multicast()
                || cgnat
                || reserved
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            let link_local = first & 0xffc0 == 0xfe80;
            let unique_local = first & 0xfe00 == 0xfc00;
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || link_local
                || unique_local
                || v6.to_ipv4_mapped().is_some()
        }
    }
}
