//! Relay identity and capability flags.

use std::collections::HashSet;

use nostr::PublicKey;
use serde::{Deserialize, Serialize};

use crate::url::CanonicalRelayUrl;

/// What a relay may be used for.
///
/// Capabilities only ever grow: adding a relay that is already known ORs the
/// new flags into the existing ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// Subscriptions for regular feeds are sent here.
    pub read: bool,
    /// Our own events are published here.
    pub write: bool,
    /// Search (NIP-50) subscriptions are sent here.
    pub search: bool,
    /// Relay expects NIP-42 authentication.
    pub auth: bool,
}

impl Capabilities {
    /// Read only.
    pub const READ: Self = Self {
        read: true,
        write: false,
        search: false,
        auth: false,
    };

    /// Write only.
    pub const WRITE: Self = Self {
        read: false,
        write: true,
        search: false,
        auth: false,
    };

    /// Read and write, the usual configuration for an own relay.
    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
        search: false,
        auth: false,
    };

    /// OR the flags of `other` into `self`. Returns true if anything changed.
    pub fn merge(&mut self, other: Capabilities) -> bool {
        let before = *self;
        self.read |= other.read;
        self.write |= other.write;
        self.search |= other.search;
        self.auth |= other.auth;
        before != *self
    }
}

/// Canonical identity plus capabilities for one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    /// Canonical URL, the registry key.
    pub url: CanonicalRelayUrl,
    /// Capability flags.
    pub capabilities: Capabilities,
    /// Pubkeys whose events must never be published to this relay.
    pub excluded_pubkeys: HashSet<PublicKey>,
}

impl RelayEndpoint {
    pub fn new(url: CanonicalRelayUrl, capabilities: Capabilities) -> Self {
        Self {
            url,
            capabilities,
            excluded_pubkeys: HashSet::new(),
        }
    }

    /// Endpoint for a single-purpose service channel (wallet connect, remote signer).
    pub fn service(url: CanonicalRelayUrl) -> Self {
        Self::new(url, Capabilities::READ_WRITE)
    }

    pub fn with_excluded_pubkeys(mut self, pubkeys: impl IntoIterator<Item = PublicKey>) -> Self {
        self.excluded_pubkeys.extend(pubkeys);
        self
    }

    /// Upgrade capability flags with those of `other`. The URL and exclusions stay as they are.
    pub fn merge_capabilities(&mut self, other: &RelayEndpoint) -> bool {
        self.capabilities.merge(other.capabilities)
    }

    /// Whether the relay is part of the regular read/write set.
    pub fn should_connect(&self) -> bool {
        self.capabilities.read || self.capabilities.write
    }

    pub fn excludes(&self, pubkey: Option<&PublicKey>) -> bool {
        pubkey.is_some_and(|pk| self.excluded_pubkeys.contains(pk))
    }
}
