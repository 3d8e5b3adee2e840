//! Client-to-relay and relay-to-client wire messages.
//!
//! The pool routes messages, it does not interpret them. Outbound messages are
//! kept as typed frames only as long as routing needs to look inside them
//! (subscription id, authors, p-tags); inbound frames are handed to consumers
//! as raw text, with [`RelayFrame::label`] and [`RelayFrame::parse`] available
//! for the few cases the pool itself cares about.

use nostr::{Event, Filter, JsonUtil, PublicKey};
use serde_json::Value;

use crate::{Error, Result};

/// Which capability a relay needs to receive a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RelayType {
    #[default]
    Read,
    Write,
    Search,
}

/// Which connection category a message is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MessageTarget {
    /// Ordinary relays (primary and outbox).
    #[default]
    Relays,
    /// Only Nostr Wallet Connect service channels.
    NwcOnly,
    /// Only Nostr Connect (remote signer) service channels.
    NcOnly,
}

/// A client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    Event(Box<Event>),
    Close {
        subscription_id: String,
    },
}

/// A client frame plus the routing metadata the dispatcher needs.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub frame: ClientFrame,
    pub relay_type: RelayType,
    pub target: MessageTarget,
}

impl OutboundMessage {
    /// Subscription for regular feeds, sent to read relays.
    pub fn req(subscription_id: impl Into<String>, filters: Vec<Filter>) -> Self {
        Self {
            frame: ClientFrame::Req {
                subscription_id: subscription_id.into(),
                filters,
            },
            relay_type: RelayType::Read,
            target: MessageTarget::Relays,
        }
    }

    /// Subscription sent only to search relays.
    pub fn search(subscription_id: impl Into<String>, filters: Vec<Filter>) -> Self {
        Self {
            relay_type: RelayType::Search,
            ..Self::req(subscription_id, filters)
        }
    }

    /// Publish a signed event to write relays.
    pub fn event(event: Event) -> Self {
        Self {
            frame: ClientFrame::Event(Box::new(event)),
            relay_type: RelayType::Write,
            target: MessageTarget::Relays,
        }
    }

    pub fn close(subscription_id: impl Into<String>) -> Self {
        Self {
            frame: ClientFrame::Close {
                subscription_id: subscription_id.into(),
            },
            relay_type: RelayType::Read,
            target: MessageTarget::Relays,
        }
    }

    pub fn with_relay_type(mut self, relay_type: RelayType) -> Self {
        self.relay_type = relay_type;
        self
    }

    pub fn with_target(mut self, target: MessageTarget) -> Self {
        self.target = target;
        self
    }

    pub fn subscription_id(&self) -> Option<&str> {
        match &self.frame {
            ClientFrame::Req {
                subscription_id, ..
            }
            | ClientFrame::Close { subscription_id } => Some(subscription_id),
            ClientFrame::Event(_) => None,
        }
    }

    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self.frame {
            ClientFrame::Req { .. } => "REQ",
            ClientFrame::Event(_) => "EVENT",
            ClientFrame::Close { .. } => "CLOSE",
        }
    }

    /// Encode as a JSON text frame.
    pub fn to_wire(&self) -> Result<String> {
        let frame = match &self.frame {
            ClientFrame::Req {
                subscription_id,
                filters,
            } => {
                let mut parts = Vec::with_capacity(filters.len() + 2);
                parts.push(Value::from("REQ"));
                parts.push(Value::from(subscription_id.as_str()));
                for filter in filters {
                    parts.push(serde_json::to_value(filter)?);
                }
                Value::Array(parts)
            }
            ClientFrame::Event(event) => {
                Value::Array(vec![Value::from("EVENT"), serde_json::to_value(event)?])
            }
            ClientFrame::Close { subscription_id } => {
                Value::Array(vec![Value::from("CLOSE"), Value::from(subscription_id.as_str())])
            }
        };
        Ok(frame.to_string())
    }
}

/// Pubkeys referenced by `p` tags of an event.
pub fn tagged_pubkeys(event: &Event) -> Vec<PublicKey> {
    let mut out = Vec::new();
    for tag in event.tags.iter() {
        let parts = tag.as_slice();
        if parts.len() >= 2
            && parts[0] == "p"
            && let Ok(pk) = PublicKey::from_hex(&parts[1])
            && !out.contains(&pk)
        {
            out.push(pk);
        }
    }
    out
}

/// A decoded relay-to-client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    Event {
        subscription_id: String,
        event: Box<Event>,
    },
    Eose {
        subscription_id: String,
    },
    Closed {
        subscription_id: String,
        message: String,
    },
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Notice(String),
    Auth(String),
}

impl RelayFrame {
    /// Read the frame label (`"EVENT"`, `"EOSE"`, ...) without decoding the rest.
    pub fn label(raw: &str) -> Option<&str> {
        let rest = raw.trim_start().strip_prefix('[')?.trim_start();
        let rest = rest.strip_prefix('"')?;
        let end = rest.find('"')?;
        Some(&rest[..end])
    }

    /// Decode a frame. Unknown labels are an error.
    pub fn parse(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)?;
        let parts = value
            .as_array()
            .ok_or_else(|| Error::MalformedFrame("frame is not a JSON array".to_string()))?;

        let text = |i: usize| -> Result<String> {
            parts
                .get(i)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::MalformedFrame(format!("missing string at position {i}")))
        };

        match text(0)?.as_str() {
            "EVENT" => {
                let event = parts
                    .get(2)
                    .ok_or_else(|| Error::MalformedFrame("EVENT without event".to_string()))?;
                Ok(Self::Event {
                    subscription_id: text(1)?,
                    event: Box::new(Event::from_json(event.to_string())?),
                })
            }
            "EOSE" => Ok(Self::Eose {
                subscription_id: text(1)?,
            }),
            "CLOSED" => Ok(Self::Closed {
                subscription_id: text(1)?,
                message: text(2).unwrap_or_default(),
            }),
            "OK" => Ok(Self::Ok {
                event_id: text(1)?,
                accepted: parts.get(2).and_then(Value::as_bool).unwrap_or(false),
                message: text(3).unwrap_or_default(),
            }),
            "NOTICE" => Ok(Self::Notice(text(1)?)),
            "AUTH" => Ok(Self::Auth(text(1)?)),
            other => Err(Error::MalformedFrame(format!("unknown label '{other}'"))),
        }
    }
}
