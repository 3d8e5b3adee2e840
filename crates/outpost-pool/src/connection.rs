//! One connection to one relay, as an explicit state machine.
//!
//! ```text
//!                connect()            handshake ok
//! Disconnected ───────────▶ Connecting ───────────▶ Connected
//!      ▲                        │                       │
//!      │   handshake failed     │      socket error /   │
//!      └────────────────────────┴──── disconnect() ─────┘
//! ```
//!
//! The socket itself lives in a spawned task. `connect()` returns at once; the
//! task reports back through [`SocketEvent`]s which the pool actor feeds into
//! [`Connection::apply`]. Every socket gets a process-unique id, so events
//! from a socket that has since been torn down are recognized and ignored.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use outpost_core::{CanonicalRelayUrl, RelayEndpoint};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::TransportError;
use crate::scheduler::PoolEvent;
use crate::transport::{RelaySocket, Transport, WireFrame};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Registry partition a connection lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Partition {
    Primary,
    Outbox,
    Ephemeral,
    Service,
}

impl Partition {
    pub const ALL: [Partition; 4] = [
        Partition::Primary,
        Partition::Outbox,
        Partition::Ephemeral,
        Partition::Service,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Outbox => "outbox",
            Self::Ephemeral => "ephemeral",
            Self::Service => "service",
        }
    }
}

/// Registry key: canonical URL for relay partitions, opaque id for service channels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConnectionKey {
    Primary(CanonicalRelayUrl),
    Outbox(CanonicalRelayUrl),
    Ephemeral(CanonicalRelayUrl),
    Service(String),
}

impl ConnectionKey {
    pub fn partition(&self) -> Partition {
        match self {
            Self::Primary(_) => Partition::Primary,
            Self::Outbox(_) => Partition::Outbox,
            Self::Ephemeral(_) => Partition::Ephemeral,
            Self::Service(_) => Partition::Service,
        }
    }

    /// Key for `url` in a relay partition. Service channels are keyed by id instead.
    pub fn for_url(partition: Partition, url: CanonicalRelayUrl) -> Option<Self> {
        match partition {
            Partition::Primary => Some(Self::Primary(url)),
            Partition::Outbox => Some(Self::Outbox(url)),
            Partition::Ephemeral => Some(Self::Ephemeral(url)),
            Partition::Service => None,
        }
    }
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary(url) => write!(f, "primary:{}", url),
            Self::Outbox(url) => write!(f, "outbox:{}", url),
            Self::Ephemeral(url) => write!(f, "ephemeral:{}", url),
            Self::Service(id) => write!(f, "service:{}", id),
        }
    }
}

/// What a connection is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionCategory {
    Normal,
    Outbox,
    Ephemeral,
    /// Nostr Wallet Connect channel.
    Nwc,
    /// Nostr Connect (remote signer) channel.
    Nc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketState {
    Disconnected,
    Connecting,
    Connected,
}

/// Exponential reconnect backoff.
///
/// Only handshake failures grow the delay. The connection itself never
/// retries; callers consult [`Backoff::ready`] before connecting.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: u32,
    retry_at: Option<Instant>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: 0,
            retry_at: None,
        }
    }

    pub fn ready(&self, now: Instant) -> bool {
        self.retry_at.is_none_or(|at| now >= at)
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Delay that the next failure will impose.
    pub fn next_delay(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.failures.min(16));
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn record_failure(&mut self, now: Instant) {
        let delay = self.next_delay();
        self.failures = self.failures.saturating_add(1);
        self.retry_at = Some(now + delay);
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.retry_at = None;
    }
}

/// What a socket task reports.
#[derive(Debug)]
pub(crate) enum SocketEventKind {
    Connected,
    ConnectFailed(TransportError),
    Message(String),
    Pong,
    Disconnected(TransportError),
}

#[derive(Debug)]
pub(crate) struct SocketEvent {
    pub(crate) key: ConnectionKey,
    pub(crate) socket_id: u64,
    pub(crate) kind: SocketEventKind,
}

/// Shared pieces every socket task needs.
#[derive(Clone)]
pub(crate) struct SocketLink {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) events: mpsc::UnboundedSender<PoolEvent>,
}

struct SocketHandle {
    id: u64,
    outbound: mpsc::UnboundedSender<WireFrame>,
    task: JoinHandle<()>,
}

/// A connection to one relay in one partition.
pub struct Connection {
    id: u64,
    key: ConnectionKey,
    endpoint: RelayEndpoint,
    category: ConnectionCategory,
    state: SocketState,
    created_at: Instant,
    last_message_received_at: Option<Instant>,
    /// Last frame queued or received; creation counts.
    last_activity_at: Instant,
    connect_started_at: Option<Instant>,
    backoff: Backoff,
    active_subscriptions: HashSet<String>,
    socket: Option<SocketHandle>,
}

impl Connection {
    pub(crate) fn new(
        key: ConnectionKey,
        endpoint: RelayEndpoint,
        category: ConnectionCategory,
        backoff: Backoff,
    ) -> Self {
        Self {
            id: next_id(),
            key,
            endpoint,
            category,
            state: SocketState::Disconnected,
            created_at: Instant::now(),
            last_message_received_at: None,
            last_activity_at: Instant::now(),
            connect_started_at: None,
            backoff,
            active_subscriptions: HashSet::new(),
            socket: None,
        }
    }

    /// Process-unique instance id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn url(&self) -> &CanonicalRelayUrl {
        &self.endpoint.url
    }

    pub fn endpoint(&self) -> &RelayEndpoint {
        &self.endpoint
    }

    pub(crate) fn endpoint_mut(&mut self) -> &mut RelayEndpoint {
        &mut self.endpoint
    }

    pub fn category(&self) -> ConnectionCategory {
        self.category
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SocketState::Connected
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_message_received_at(&self) -> Option<Instant> {
        self.last_message_received_at
    }

    pub fn last_activity_at(&self) -> Instant {
        self.last_activity_at
    }

    /// No open subscriptions and no traffic for `idle_after`.
    pub(crate) fn is_idle(&self, now: Instant, idle_after: Duration) -> bool {
        self.active_subscriptions.is_empty()
            && now.saturating_duration_since(self.last_activity_at) >= idle_after
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn reset_backoff(&mut self) {
        self.backoff.reset();
    }

    /// Start a handshake unless one is running, the socket is up, or backoff says wait.
    ///
    /// Returns true if a handshake was started.
    pub(crate) fn connect(&mut self, link: &SocketLink) -> bool {
        if self.state != SocketState::Disconnected {
            return false;
        }

        let now = Instant::now();
        if !self.backoff.ready(now) {
            tracing::debug!(
                "Not connecting {}: backing off after {} failures",
                self.key,
                self.backoff.failures()
            );
            return false;
        }

        let socket_id = next_id();
        let (outbound, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_socket(
            Arc::clone(&link.transport),
            self.endpoint.url.clone(),
            self.key.clone(),
            socket_id,
            rx,
            link.events.clone(),
        ));

        self.socket = Some(SocketHandle {
            id: socket_id,
            outbound,
            task,
        });
        self.state = SocketState::Connecting;
        self.connect_started_at = Some(now);
        tracing::debug!("Connecting {}", self.key);
        true
    }

    /// Tear the socket down. Safe in every state.
    pub(crate) fn disconnect(&mut self) {
        if let Some(socket) = self.socket.take() {
            socket.task.abort();
        }
        self.state = SocketState::Disconnected;
        self.active_subscriptions.clear();
        self.last_message_received_at = None;
        self.connect_started_at = None;
    }

    /// Queue a frame. Frames sent while connecting are flushed, in order, once
    /// the handshake completes. Returns false when there is no socket.
    pub(crate) fn send(&mut self, frame: WireFrame) -> bool {
        match &self.socket {
            Some(socket) if self.state != SocketState::Disconnected => {
                let queued = socket.outbound.send(frame).is_ok();
                if queued {
                    self.last_activity_at = Instant::now();
                }
                queued
            }
            _ => false,
        }
    }

    pub(crate) fn send_text(&mut self, text: &str) -> bool {
        self.send(WireFrame::Text(text.to_string()))
    }

    /// Websocket-level ping. Only meaningful while connected.
    pub(crate) fn ping(&mut self) -> bool {
        self.is_connected() && self.send(WireFrame::Ping)
    }

    /// Fold a socket event into the state machine. Returns false for events
    /// from a socket that is no longer ours.
    pub(crate) fn apply(&mut self, event: &SocketEvent) -> bool {
        if self.socket.as_ref().is_none_or(|s| s.id != event.socket_id) {
            return false;
        }

        let now = Instant::now();
        match &event.kind {
            SocketEventKind::Connected => {
                self.state = SocketState::Connected;
                self.last_message_received_at = Some(now);
                self.backoff.reset();
            }
            SocketEventKind::ConnectFailed(_) => {
                self.socket = None;
                self.state = SocketState::Disconnected;
                self.active_subscriptions.clear();
                self.connect_started_at = None;
                self.backoff.record_failure(now);
            }
            SocketEventKind::Message(_) | SocketEventKind::Pong => {
                self.last_message_received_at = Some(now);
                self.last_activity_at = now;
            }
            SocketEventKind::Disconnected(_) => {
                self.socket = None;
                self.state = SocketState::Disconnected;
                self.active_subscriptions.clear();
                self.last_message_received_at = None;
                self.connect_started_at = None;
            }
        }
        true
    }

    /// Time since `connect()` started, for the handshake duration histogram.
    pub(crate) fn connecting_for(&self) -> Option<Duration> {
        self.connect_started_at.map(|t| t.elapsed())
    }

    // =========================================================================
    // Subscription bookkeeping
    // =========================================================================

    pub fn has_subscription(&self, id: &str) -> bool {
        self.active_subscriptions.contains(id)
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &str> {
        self.active_subscriptions.iter().map(String::as_str)
    }

    pub(crate) fn add_subscription(&mut self, id: &str) -> bool {
        self.active_subscriptions.insert(id.to_string())
    }

    pub(crate) fn remove_subscription(&mut self, id: &str) -> bool {
        self.active_subscriptions.remove(id)
    }

    /// Service channels keep exactly one live subscription.
    pub(crate) fn replace_subscriptions(&mut self, id: &str) {
        self.active_subscriptions.clear();
        self.active_subscriptions.insert(id.to_string());
    }

    pub(crate) fn take_subscriptions_matching(&mut self, prefixes: &[String]) -> Vec<String> {
        let matching: Vec<String> = self
            .active_subscriptions
            .iter()
            .filter(|id| prefixes.iter().any(|p| id.starts_with(p.as_str())))
            .cloned()
            .collect();
        for id in &matching {
            self.active_subscriptions.remove(id);
        }
        matching
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(socket) = self.socket.take() {
            socket.task.abort();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("category", &self.category)
            .field("state", &self.state)
            .field("subscriptions", &self.active_subscriptions.len())
            .finish()
    }
}

/// Socket task: handshake, then pump frames both ways until either side stops.
async fn run_socket(
    transport: Arc<dyn Transport>,
    url: CanonicalRelayUrl,
    key: ConnectionKey,
    socket_id: u64,
    mut outbound: mpsc::UnboundedReceiver<WireFrame>,
    events: mpsc::UnboundedSender<PoolEvent>,
) {
    let report = |kind: SocketEventKind| {
        let _ = events.send(PoolEvent::Socket(SocketEvent {
            key: key.clone(),
            socket_id,
            kind,
        }));
    };

    let RelaySocket {
        mut sink,
        mut stream,
    } = match transport.connect(&url).await {
        Ok(socket) => socket,
        Err(e) => {
            report(SocketEventKind::ConnectFailed(e));
            return;
        }
    };
    report(SocketEventKind::Connected);

    let reason = loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        break e;
                    }
                }
                None => {
                    let _ = sink.send(WireFrame::Close).await;
                    break TransportError::Closed;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(WireFrame::Text(text))) => report(SocketEventKind::Message(text)),
                Some(Ok(WireFrame::Pong)) => report(SocketEventKind::Pong),
                Some(Ok(WireFrame::Ping)) => {}
                Some(Ok(WireFrame::Close)) | None => break TransportError::Closed,
                Some(Err(e)) => break e,
            },
        }
    };
    report(SocketEventKind::Disconnected(reason));
}
