//! Error types shared by the outpost crates.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while handling relay identities and wire messages.
#[derive(Error, Debug)]
pub enum Error {
    /// The relay URL could not be parsed or uses an unsupported scheme.
    #[error("invalid relay URL '{url}': {reason}")]
    InvalidRelayUrl {
        /// The URL as supplied by the caller.
        url: String,
        /// Description of what's wrong.
        reason: String,
    },

    /// The relay URL points at a host we never route to (loopback, private ranges, ...).
    #[error("blocked relay URL '{url}': {reason}")]
    BlockedRelayUrl {
        /// The normalized URL.
        url: String,
        /// Which blocklist rule matched.
        reason: String,
    },

    /// A wire frame could not be decoded.
    #[error("malformed relay frame: {0}")]
    MalformedFrame(String),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Nostr event decoding error.
    #[error("nostr event error: {0}")]
    Event(#[from] nostr::event::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Error Display formatting tests
    // =========================================================================

    #[test]
    fn test_invalid_relay_url_display() {
        let err = Error::InvalidRelayUrl {
            url: "https://relay.example.com".to_string(),
            reason: "URL must start with wss:// or ws://".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("invalid relay URL"));
        assert!(msg.contains("https://relay.example.com"));
        assert!(msg.contains("wss://"));
    }

    #[test]
    fn test_blocked_relay_url_display() {
        let err = Error::BlockedRelayUrl {
            url: "wss://localhost".to_string(),
            reason: "localhost not allowed".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("blocked relay URL"));
        assert!(msg.contains("localhost not allowed"));
    }

    #[test]
    fn test_malformed_frame_display() {
        let err = Error::MalformedFrame("frame is not a JSON array".to_string());
        assert!(err.to_string().contains("not a JSON array"));
    }

    // =========================================================================
    // Error From conversions
    // =========================================================================

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("[\"EOSE\"").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
        assert!(err.to_string().contains("JSON error"));
    }
}
