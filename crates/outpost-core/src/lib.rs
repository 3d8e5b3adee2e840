//! Core types for the outpost relay pool.
//!
//! This crate provides:
//! - Canonical relay URLs and the host blocklist for untrusted URLs
//! - Relay endpoints with capability flags
//! - Outbound client frames and inbound relay frame decoding
//! - Sanitizing of NIP-65 relay list events
//! - Prometheus metrics helpers
//! - Shared error types

pub mod endpoint;
mod error;
pub mod message;
pub mod metrics;
pub mod relay_list;
pub mod url;

pub use endpoint::{Capabilities, RelayEndpoint};
pub use error::{Error, Result};
pub use message::{ClientFrame, MessageTarget, OutboundMessage, RelayFrame, RelayType, tagged_pubkeys};
pub use relay_list::{RelayList, RelayListEntry, RelayListRejection, RelayListSanitizer, RelayMarker};
pub use url::{CanonicalRelayUrl, HostBlock, NormalizeOptions, NormalizeResult, normalize_relay_url};
