//! Sanitizing of relay list metadata events (kind 10002, NIP-65).
//!
//! Relay lists are written by other people and drive how many sockets we
//! open, so they are treated as hostile input. A list is accepted whole or not
//! at all: one bad entry rejects the entire event.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use nostr::{Event, Kind, PublicKey, Timestamp};

use crate::url::{CanonicalRelayUrl, NormalizeOptions, NormalizeResult, normalize_relay_url_with_opts};

/// Default upper bound on `r` tags in a single relay list.
pub const DEFAULT_MAX_RELAYS_PER_LIST: usize = 20;

/// Direction marker of an `r` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayMarker {
    Read,
    Write,
    Both,
}

impl RelayMarker {
    /// The author reads from this relay (deliver mentions here).
    pub fn reads(self) -> bool {
        matches!(self, Self::Read | Self::Both)
    }

    /// The author publishes to this relay (find their events here).
    pub fn writes(self) -> bool {
        matches!(self, Self::Write | Self::Both)
    }

    fn union(self, other: Self) -> Self {
        if self == other { self } else { Self::Both }
    }
}

/// One accepted relay of a list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayListEntry {
    pub url: CanonicalRelayUrl,
    pub marker: RelayMarker,
}

/// A sanitized relay list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayList {
    pub author: PublicKey,
    pub created_at: Timestamp,
    pub relays: Vec<RelayListEntry>,
}

impl RelayList {
    /// Relays the author publishes to.
    pub fn write_relays(&self) -> impl Iterator<Item = &CanonicalRelayUrl> {
        self.relays.iter().filter(|r| r.marker.writes()).map(|r| &r.url)
    }

    /// Relays the author reads from.
    pub fn read_relays(&self) -> impl Iterator<Item = &CanonicalRelayUrl> {
        self.relays.iter().filter(|r| r.marker.reads()).map(|r| &r.url)
    }
}

/// Reason a relay list event was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayListRejection {
    /// Not a kind 10002 event.
    WrongKind(u16),
    /// More `r` tags than anyone plausibly uses.
    TooManyRelays { count: usize, max: usize },
    /// An `r` tag without a URL.
    MissingUrl,
    /// A URL that does not parse as a websocket URL.
    InvalidUrl { url: String, reason: String },
    /// A URL pointing at a host we never connect to.
    BlockedUrl { url: String, reason: String },
    /// A marker other than `read` or `write`.
    UnknownMarker(String),
}

impl std::fmt::Display for RelayListRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WrongKind(kind) => write!(f, "kind {} is not a relay list", kind),
            Self::TooManyRelays { count, max } => {
                write!(f, "declares {} relays (max {})", count, max)
            }
            Self::MissingUrl => write!(f, "r tag without url"),
            Self::InvalidUrl { url, reason } => write!(f, "invalid url '{}': {}", url, reason),
            Self::BlockedUrl { url, reason } => write!(f, "blocked url '{}': {}", url, reason),
            Self::UnknownMarker(marker) => write!(f, "unknown marker '{}'", marker),
        }
    }
}

/// Validates relay list events.
#[derive(Debug, Clone)]
pub struct RelayListSanitizer {
    max_relays: usize,
    normalize: NormalizeOptions,
}

impl Default for RelayListSanitizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RELAYS_PER_LIST)
    }
}

impl RelayListSanitizer {
    pub fn new(max_relays: usize) -> Self {
        Self {
            max_relays,
            normalize: NormalizeOptions::default(),
        }
    }

    pub fn with_normalize_options(mut self, opts: NormalizeOptions) -> Self {
        self.normalize = opts;
        self
    }

    /// Validate one event. Duplicate URLs are merged, their markers combined.
    pub fn sanitize(&self, event: &Event) -> Result<RelayList, RelayListRejection> {
        if event.kind != Kind::RelayList {
            return Err(RelayListRejection::WrongKind(event.kind.as_u16()));
        }

        let r_tags: Vec<&[String]> = event
            .tags
            .iter()
            .map(|tag| tag.as_slice())
            .filter(|parts| parts.first().is_some_and(|name| name == "r"))
            .collect();

        if r_tags.len() > self.max_relays {
            return Err(RelayListRejection::TooManyRelays {
                count: r_tags.len(),
                max: self.max_relays,
            });
        }

        let mut relays: Vec<RelayListEntry> = Vec::with_capacity(r_tags.len());
        for parts in r_tags {
            let raw_url = parts.get(1).ok_or(RelayListRejection::MissingUrl)?;

            let url = match normalize_relay_url_with_opts(raw_url, &self.normalize) {
                NormalizeResult::Ok(u) => u,
                NormalizeResult::Invalid(reason) => {
                    return Err(RelayListRejection::InvalidUrl {
                        url: raw_url.clone(),
                        reason,
                    });
                }
                NormalizeResult::Blocked(reason) => {
                    return Err(RelayListRejection::BlockedUrl {
                        url: raw_url.clone(),
                        reason: reason.to_string(),
                    });
                }
            };

            let marker = match parts.get(2).map(|m| m.as_str()) {
                None | Some("") => RelayMarker::Both,
                Some("read") => RelayMarker::Read,
                Some("write") => RelayMarker::Write,
                Some(other) => return Err(RelayListRejection::UnknownMarker(other.to_string())),
            };

            match relays.iter_mut().find(|r| r.url == url) {
                Some(existing) => existing.marker = existing.marker.union(marker),
                None => relays.push(RelayListEntry { url, marker }),
            }
        }

        Ok(RelayList {
            author: event.pubkey,
            created_at: event.created_at,
            relays,
        })
    }

    /// Validate a batch, keeping only the newest accepted list per author.
    pub fn sanitize_all<'a>(
        &self,
        events: impl IntoIterator<Item = &'a Event>,
    ) -> HashMap<PublicKey, RelayList> {
        let mut lists: HashMap<PublicKey, RelayList> = HashMap::new();
        for event in events {
            let list = match self.sanitize(event) {
                Ok(list) => list,
                Err(reason) => {
                    tracing::debug!("Dropping relay list {} from {}: {}", event.id, event.pubkey, reason);
                    metrics::counter!("pool_relay_lists_rejected_total").increment(1);
                    continue;
                }
            };
            merge_newest(&mut lists, list);
        }
        lists
    }
}

/// Insert `list` unless a newer one for the same author is already present.
pub fn merge_newest(lists: &mut HashMap<PublicKey, RelayList>, list: RelayList) {
    match lists.entry(list.author) {
        Entry::Occupied(mut existing) => {
            if list.created_at > existing.get().created_at {
                existing.insert(list);
            }
        }
        Entry::Vacant(slot) => {
            slot.insert(list);
        }
    }
}
