//! The relay pool: a cheap handle plus the actor that owns all pool state.
//!
//! [`RelayPool`] only enqueues commands. A single spawned task, the pool
//! actor, owns the connection registry, the outbox router, the penalty box,
//! per-relay statistics and the keepalive supervisor, and reacts to three
//! sources: caller commands, socket/timer events, and the keepalive interval.
//! Nothing is shared behind a lock, so every routing decision sees one
//! consistent view of all four partitions.
//!
//! Status for UI-like readers is published through a `watch` channel after
//! every step of the actor and can be read without waiting on it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use nostr::Event;
use outpost_core::{
    CanonicalRelayUrl, Capabilities, ClientFrame, NormalizeResult, OutboundMessage, RelayEndpoint,
    RelayFrame, RelayListSanitizer, normalize_relay_url,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::PoolConfig;
use crate::connection::{
    Connection, ConnectionCategory, ConnectionKey, Partition, SocketEvent, SocketEventKind,
    SocketLink, SocketState,
};
use crate::dispatcher::{DispatchReport, Dispatcher, SendOptions};
use crate::penalty::{PenaltyPolicy, RelayConnectionStats, StatsBook};
use crate::registry::ConnectionRegistry;
use crate::router::OutboxRouter;
use crate::scheduler::{PoolEvent, Scheduler};
use crate::supervisor::Supervisor;
use crate::transport::{Transport, WebSocketTransport};
use crate::{Error, Result};

/// Receives every text frame from every relay, raw.
pub trait InboundHandler: Send + 'static {
    fn on_message(&mut self, relay: &CanonicalRelayUrl, raw: &str);
}

impl<F> InboundHandler for F
where
    F: FnMut(&CanonicalRelayUrl, &str) + Send + 'static,
{
    fn on_message(&mut self, relay: &CanonicalRelayUrl, raw: &str) {
        self(relay, raw)
    }
}

/// Kind of a service channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    /// Nostr Wallet Connect.
    Nwc,
    /// Nostr Connect (remote signer).
    Nc,
}

impl From<ServiceKind> for ConnectionCategory {
    fn from(kind: ServiceKind) -> Self {
        match kind {
            ServiceKind::Nwc => ConnectionCategory::Nwc,
            ServiceKind::Nc => ConnectionCategory::Nc,
        }
    }
}

/// Connection counts, republished after every actor step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStatus {
    pub primary_connected: usize,
    pub outbox_connected: usize,
    pub ephemeral_connected: usize,
    pub service_connected: usize,
    /// Relays with a connected socket in any relay partition.
    pub connected_urls: BTreeSet<CanonicalRelayUrl>,
}

impl PoolStatus {
    pub fn any_connected(&self) -> bool {
        self.primary_connected + self.outbox_connected + self.ephemeral_connected + self.service_connected > 0
    }

    pub fn is_url_connected(&self, url: &CanonicalRelayUrl) -> bool {
        self.connected_urls.contains(url)
    }
}

/// Read-only copy of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub key: ConnectionKey,
    pub url: CanonicalRelayUrl,
    pub category: ConnectionCategory,
    pub state: SocketState,
    pub capabilities: Capabilities,
    /// Sorted.
    pub subscriptions: Vec<String>,
    pub backoff_failures: u32,
}

impl From<&Connection> for ConnectionInfo {
    fn from(conn: &Connection) -> Self {
        let mut subscriptions: Vec<String> = conn.subscriptions().map(str::to_string).collect();
        subscriptions.sort();
        Self {
            key: conn.key().clone(),
            url: conn.url().clone(),
            category: conn.category(),
            state: conn.state(),
            capabilities: conn.endpoint().capabilities,
            subscriptions,
            backoff_failures: conn.backoff().failures(),
        }
    }
}

/// Point-in-time view of the whole pool.
#[derive(Debug, Clone, Default)]
pub struct PoolSnapshot {
    pub connections: Vec<ConnectionInfo>,
    pub penalty_box: Vec<CanonicalRelayUrl>,
    pub stats: HashMap<CanonicalRelayUrl, RelayConnectionStats>,
    pub preferred_find_relays: usize,
    pub preferred_reach_relays: usize,
    pub keepalive_armed: bool,
}

impl PoolSnapshot {
    pub fn connection(&self, key: &ConnectionKey) -> Option<&ConnectionInfo> {
        self.connections.iter().find(|c| &c.key == key)
    }

    pub fn count(&self, partition: Partition) -> usize {
        self.connections.iter().filter(|c| c.key.partition() == partition).count()
    }
}

enum Command {
    AddRelay(RelayEndpoint),
    RemoveRelay(CanonicalRelayUrl),
    AddService {
        id: String,
        url: CanonicalRelayUrl,
        kind: ServiceKind,
    },
    RemoveService(String),
    ConnectAll {
        reset_backoff: bool,
    },
    ConnectAllWrite,
    ConnectFeedRelays(Vec<RelayEndpoint>),
    DisconnectAll,
    DisconnectAllAdditional,
    Send {
        message: OutboundMessage,
        options: SendOptions,
        reply: Option<oneshot::Sender<Result<DispatchReport>>>,
    },
    SendEphemeral {
        url: CanonicalRelayUrl,
        message: OutboundMessage,
    },
    RemoveSubscriptionsWithPrefixes(Vec<String>),
    ForgetSubscriptionsWithPrefix(String),
    SetPreferredRelays(Vec<Event>),
    AddRelayLists(Vec<Event>),
    ReloadPreferredRelays,
    Penalize(CanonicalRelayUrl),
    Release(CanonicalRelayUrl),
    SetForeground(bool),
    SetNetworkReachable(bool),
    SetVpnDetected(bool),
    SetLowDataMode(bool),
    SetOutboxEnabled(bool),
    Snapshot(oneshot::Sender<PoolSnapshot>),
    ConnectionByUrl(CanonicalRelayUrl, oneshot::Sender<Option<ConnectionInfo>>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a relay pool.
///
/// Cloning is cheap; all clones talk to the same pool. Every method returns
/// as soon as the command is queued, except the queries, which await the
/// actor's answer. Each `RelayPool::new` builds an independent pool, so tests
/// and multi-account setups simply construct more than one.
#[derive(Clone)]
pub struct RelayPool {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<PoolStatus>,
}

impl RelayPool {
    /// Start a pool on websockets. Must be called inside a tokio runtime.
    pub fn new(config: PoolConfig, handler: impl InboundHandler) -> Result<Self> {
        let transport = Arc::new(WebSocketTransport::new(config.connect_timeout));
        Self::with_transport(config, transport, handler)
    }

    /// Start a pool on a custom transport. Must be called inside a tokio runtime.
    pub fn with_transport(
        config: PoolConfig,
        transport: Arc<dyn Transport>,
        handler: impl InboundHandler,
    ) -> Result<Self> {
        config.validate()?;
        let deny_list = config.deny_list()?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(PoolStatus::default());

        let link = SocketLink {
            transport,
            events: event_tx.clone(),
        };
        let registry = ConnectionRegistry::new(
            link,
            Scheduler::new(event_tx),
            config.ephemeral_ttl,
            config.backoff_base,
            config.backoff_max,
        );
        let router = OutboxRouter::new(
            RelayListSanitizer::new(config.max_relays_per_list),
            deny_list,
            config.max_preferred_relays,
        );

        tracing::info!(
            "Starting relay pool (outbox {}, low data {}, {} denied relays)",
            if config.outbox_enabled { "on" } else { "off" },
            if config.low_data_mode { "on" } else { "off" },
            config.special_purpose_relays.len() + config.popular_relays.len()
        );

        let actor = PoolActor {
            dispatcher: Dispatcher {
                outbox_enabled: config.outbox_enabled,
                low_data_mode: config.low_data_mode,
                skip_top_relays: config.skip_top_relays,
                reach_excluded_kinds: config.reach_excluded_kinds.clone(),
            },
            supervisor: Supervisor::new(config.ping_after, config.stale_after),
            policy: PenaltyPolicy::new(config.penalty_min_errors),
            stats: StatsBook::default(),
            vpn_detected: false,
            registry,
            router,
            handler: Box::new(handler),
            status: status_tx,
            config,
        };
        tokio::spawn(actor.run(command_rx, event_rx));

        Ok(Self {
            commands: command_tx,
            status: status_rx,
        })
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::PoolClosed)
    }

    async fn query<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.command(build(tx))?;
        rx.await.map_err(|_| Error::PoolClosed)
    }

    // =========================================================================
    // Relays and service channels
    // =========================================================================

    /// Add one of the user's own relays, or widen the capabilities of a known one.
    pub fn add_relay(&self, endpoint: RelayEndpoint) -> Result<()> {
        self.command(Command::AddRelay(endpoint))
    }

    pub fn remove_relay(&self, url: CanonicalRelayUrl) -> Result<()> {
        self.command(Command::RemoveRelay(url))
    }

    /// Register a wallet connect or remote signer channel under `id`.
    pub fn add_service_connection(
        &self,
        id: impl Into<String>,
        url: CanonicalRelayUrl,
        kind: ServiceKind,
    ) -> Result<()> {
        self.command(Command::AddService {
            id: id.into(),
            url,
            kind,
        })
    }

    pub fn remove_service_connection(&self, id: impl Into<String>) -> Result<()> {
        self.command(Command::RemoveService(id.into()))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Connect every own relay that is readable or writable, and arm keepalive.
    pub fn connect_all(&self, reset_backoff: bool) -> Result<()> {
        self.command(Command::ConnectAll { reset_backoff })
    }

    /// Connect only own write relays, and arm keepalive.
    pub fn connect_all_write(&self) -> Result<()> {
        self.command(Command::ConnectAllWrite)
    }

    /// Make sure the relays of a feed are connected, reusing existing connections.
    pub fn connect_feed_relays(&self, endpoints: Vec<RelayEndpoint>) -> Result<()> {
        self.command(Command::ConnectFeedRelays(endpoints))
    }

    /// Disconnect everything and disarm keepalive.
    pub fn disconnect_all(&self) -> Result<()> {
        self.command(Command::DisconnectAll)
    }

    /// Disconnect outbox and ephemeral connections only.
    pub fn disconnect_all_additional(&self) -> Result<()> {
        self.command(Command::DisconnectAllAdditional)
    }

    /// Disconnect everything and stop the actor.
    pub async fn shutdown(&self) -> Result<()> {
        self.query(Command::Shutdown).await
    }

    // =========================================================================
    // Messages
    // =========================================================================

    pub fn send(&self, message: OutboundMessage, options: SendOptions) -> Result<()> {
        self.command(Command::Send {
            message,
            options,
            reply: None,
        })
    }

    /// Like [`send`](Self::send), but waits for the list of connections the message was queued on.
    pub async fn send_and_report(
        &self,
        message: OutboundMessage,
        options: SendOptions,
    ) -> Result<DispatchReport> {
        self.query(|reply| Command::Send {
            message,
            options,
            reply: Some(reply),
        })
        .await?
    }

    /// Send through a short-lived connection to an arbitrary relay, such as a
    /// relay hint. The URL is untrusted and goes through the host blocklist.
    pub fn send_ephemeral(&self, url: &str, message: OutboundMessage) -> Result<()> {
        let url = match normalize_relay_url(url) {
            NormalizeResult::Ok(url) => url,
            NormalizeResult::Invalid(reason) => {
                return Err(outpost_core::Error::InvalidRelayUrl {
                    url: url.to_string(),
                    reason,
                }
                .into());
            }
            NormalizeResult::Blocked(reason) => {
                return Err(outpost_core::Error::BlockedRelayUrl {
                    url: url.to_string(),
                    reason: reason.to_string(),
                }
                .into());
            }
        };
        self.command(Command::SendEphemeral { url, message })
    }

    pub fn close_subscription(&self, subscription_id: impl Into<String>) -> Result<()> {
        self.send(OutboundMessage::close(subscription_id), SendOptions::default())
    }

    /// Send CLOSE for, and forget, every subscription starting with one of `prefixes`.
    pub fn remove_subscriptions_with_prefixes(&self, prefixes: Vec<String>) -> Result<()> {
        self.command(Command::RemoveSubscriptionsWithPrefixes(prefixes))
    }

    /// Forget matching subscriptions without sending CLOSE, so the next REQ
    /// with the same id goes out again.
    pub fn forget_subscriptions_with_prefix(&self, prefix: impl Into<String>) -> Result<()> {
        self.command(Command::ForgetSubscriptionsWithPrefix(prefix.into()))
    }

    // =========================================================================
    // Outbox routing
    // =========================================================================

    /// Replace the cached relay lists and rebuild the preferred relay map.
    pub fn set_preferred_relays(&self, relay_lists: Vec<Event>) -> Result<()> {
        self.command(Command::SetPreferredRelays(relay_lists))
    }

    /// Merge more relay lists into the cache.
    pub fn add_relay_lists(&self, relay_lists: Vec<Event>) -> Result<()> {
        self.command(Command::AddRelayLists(relay_lists))
    }

    /// Rebuild the preferred relay map from the cached relay lists.
    pub fn reload_preferred_relays(&self) -> Result<()> {
        self.command(Command::ReloadPreferredRelays)
    }

    pub fn penalize(&self, url: CanonicalRelayUrl) -> Result<()> {
        self.command(Command::Penalize(url))
    }

    pub fn release(&self, url: CanonicalRelayUrl) -> Result<()> {
        self.command(Command::Release(url))
    }

    // =========================================================================
    // Environment
    // =========================================================================

    pub fn set_foreground(&self, foreground: bool) -> Result<()> {
        self.command(Command::SetForeground(foreground))
    }

    pub fn set_network_reachable(&self, reachable: bool) -> Result<()> {
        self.command(Command::SetNetworkReachable(reachable))
    }

    pub fn set_vpn_detected(&self, detected: bool) -> Result<()> {
        self.command(Command::SetVpnDetected(detected))
    }

    pub fn set_low_data_mode(&self, enabled: bool) -> Result<()> {
        self.command(Command::SetLowDataMode(enabled))
    }

    pub fn set_outbox_enabled(&self, enabled: bool) -> Result<()> {
        self.command(Command::SetOutboxEnabled(enabled))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn snapshot(&self) -> Result<PoolSnapshot> {
        self.query(Command::Snapshot).await
    }

    /// First connection for `url`: primary, then outbox, then ephemeral.
    pub async fn connection_by_url(&self, url: CanonicalRelayUrl) -> Result<Option<ConnectionInfo>> {
        self.query(|reply| Command::ConnectionByUrl(url, reply)).await
    }

    /// Latest published status. Never waits on the actor.
    pub fn status(&self) -> PoolStatus {
        self.status.borrow().clone()
    }

    pub fn is_url_connected(&self, url: &CanonicalRelayUrl) -> bool {
        self.status.borrow().is_url_connected(url)
    }

    /// Receiver that is notified whenever the status changes.
    pub fn watch_status(&self) -> watch::Receiver<PoolStatus> {
        self.status.clone()
    }
}

struct PoolActor {
    config: PoolConfig,
    registry: ConnectionRegistry,
    router: OutboxRouter,
    dispatcher: Dispatcher,
    supervisor: Supervisor,
    policy: PenaltyPolicy,
    stats: StatsBook,
    vpn_detected: bool,
    handler: Box<dyn InboundHandler>,
    status: watch::Sender<PoolStatus>,
}

impl PoolActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<PoolEvent>,
    ) {
        let period = self.config.keepalive_interval;
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.stop();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.stop();
                        break;
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
                _ = keepalive.tick() => {
                    let now = Instant::now();
                    self.supervisor.tick(&mut self.registry, now);
                    self.prune_idle(now);
                }
            }
            self.publish_status();
        }
        self.publish_status();
        tracing::info!("Relay pool stopped");
    }

    fn stop(&mut self) {
        for partition in Partition::ALL {
            self.registry.disconnect_all(partition);
        }
        self.supervisor.keepalive_armed = false;
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::AddRelay(endpoint) => {
                let connect = self.supervisor.active() && endpoint.should_connect();
                let key = self.registry.get_or_create_primary(endpoint).key().clone();
                if connect {
                    self.registry.connect(&key);
                }
            }
            Command::RemoveRelay(url) => {
                self.registry.remove(&ConnectionKey::Primary(url));
            }
            Command::AddService { id, url, kind } => {
                self.registry.get_or_create_service(&id, url, kind.into());
            }
            Command::RemoveService(id) => {
                self.registry.remove(&ConnectionKey::Service(id));
            }
            Command::ConnectAll { reset_backoff } => {
                self.supervisor.keepalive_armed = true;
                let started = self.registry.connect_all(Partition::Primary, reset_backoff, |c| {
                    c.endpoint().should_connect()
                });
                tracing::info!("Connecting {} relays", started);
            }
            Command::ConnectAllWrite => {
                self.supervisor.keepalive_armed = true;
                let started = self
                    .registry
                    .connect_all(Partition::Primary, false, |c| c.endpoint().capabilities.write);
                tracing::info!("Connecting {} write relays", started);
            }
            Command::ConnectFeedRelays(endpoints) => {
                for endpoint in endpoints {
                    let key = self.registry.get_or_create_primary(endpoint).key().clone();
                    self.registry.connect(&key);
                }
            }
            Command::DisconnectAll => {
                self.stop();
                tracing::info!("Disconnected all relays");
            }
            Command::DisconnectAllAdditional => {
                self.registry.disconnect_all(Partition::Outbox);
                self.registry.disconnect_all(Partition::Ephemeral);
            }
            Command::Send {
                message,
                options,
                reply,
            } => {
                let result = self
                    .dispatcher
                    .send(&mut self.registry, &self.router, &message, &options);
                if let Err(e) = &result {
                    tracing::warn!("Failed to send {}: {}", message.label(), e);
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Command::SendEphemeral { url, message } => self.send_ephemeral(url, message),
            Command::RemoveSubscriptionsWithPrefixes(prefixes) => {
                self.remove_subscriptions_with_prefixes(&prefixes);
            }
            Command::ForgetSubscriptionsWithPrefix(prefix) => {
                let prefixes = [prefix];
                for conn in self.registry.iter_all_mut() {
                    conn.take_subscriptions_matching(&prefixes);
                }
            }
            Command::SetPreferredRelays(events) => self.router.set_preferred_relays(events.iter()),
            Command::AddRelayLists(events) => self.router.add_relay_lists(events.iter()),
            Command::ReloadPreferredRelays => self.router.reload_preferred_relays(),
            Command::Penalize(url) => {
                if self.router.penalize(url.clone()) {
                    tracing::info!("Penalized {}", url);
                }
            }
            Command::Release(url) => {
                if self.router.release(&url) {
                    tracing::info!("Released {} from the penalty box", url);
                }
            }
            Command::SetForeground(foreground) => {
                self.supervisor.foreground = foreground;
                self.tick_if_resumed();
            }
            Command::SetNetworkReachable(reachable) => {
                self.supervisor.network_reachable = reachable;
                self.tick_if_resumed();
            }
            Command::SetVpnDetected(detected) => self.vpn_detected = detected,
            Command::SetLowDataMode(enabled) => self.dispatcher.low_data_mode = enabled,
            Command::SetOutboxEnabled(enabled) => self.dispatcher.outbox_enabled = enabled,
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::ConnectionByUrl(url, reply) => {
                let _ = reply.send(self.registry.connection_by_url(&url).map(ConnectionInfo::from));
            }
            Command::Shutdown(_) => {}
        }
    }

    /// Remove idle outbox connections, then stats for relays no longer in any
    /// partition. Penalized relays keep their stats.
    fn prune_idle(&mut self, now: Instant) {
        let pruned = self
            .registry
            .prune_idle(Partition::Outbox, now, self.config.outbox_idle_after);
        if !pruned.is_empty() {
            metrics::counter!("pool_outbox_evictions_total").increment(pruned.len() as u64);
        }

        let live: HashSet<&CanonicalRelayUrl> = self.registry.iter_all().map(|c| c.url()).collect();
        let penalty_box = self.router.penalty_box();
        let dropped = self
            .stats
            .retain(|url| live.contains(url) || penalty_box.contains(url));

        if !pruned.is_empty() || dropped > 0 {
            tracing::debug!(
                "Pruned {} idle outbox connections and {} relay stats",
                pruned.len(),
                dropped
            );
        }
    }

    /// Coming back to the foreground or online should not wait for the next interval.
    fn tick_if_resumed(&mut self) {
        if self.supervisor.active() {
            self.supervisor.tick(&mut self.registry, Instant::now());
        }
    }

    fn send_ephemeral(&mut self, url: CanonicalRelayUrl, message: OutboundMessage) {
        if self.config.vpn_guard && !self.vpn_detected {
            tracing::warn!("Refusing ephemeral connection to {}: no VPN detected", url);
            return;
        }

        let wire = match message.to_wire() {
            Ok(wire) => wire,
            Err(e) => {
                tracing::warn!("Failed to encode {} for {}: {}", message.label(), url, e);
                return;
            }
        };

        let capabilities = Capabilities {
            read: true,
            search: true,
            ..Default::default()
        };
        let key = self
            .registry
            .get_or_create_ephemeral(RelayEndpoint::new(url, capabilities))
            .key()
            .clone();
        self.registry.connect(&key);

        let Some(conn) = self.registry.get_mut(&key) else {
            return;
        };
        if !conn.send_text(&wire) {
            metrics::counter!("pool_frames_dropped_total").increment(1);
            return;
        }
        metrics::counter!("pool_frames_sent_total", "frame" => message.label()).increment(1);
        match &message.frame {
            ClientFrame::Req {
                subscription_id, ..
            } => {
                conn.add_subscription(subscription_id);
            }
            ClientFrame::Close { subscription_id } => {
                conn.remove_subscription(subscription_id);
            }
            ClientFrame::Event(_) => {}
        }
        tracing::debug!("Sent {} via {}", message.label(), key);
    }

    fn remove_subscriptions_with_prefixes(&mut self, prefixes: &[String]) {
        let mut closed = 0;
        for conn in self.registry.iter_all_mut() {
            let connected = conn.is_connected();
            for id in conn.take_subscriptions_matching(prefixes) {
                if !connected {
                    continue;
                }
                match OutboundMessage::close(id).to_wire() {
                    Ok(wire) => {
                        if conn.send_text(&wire) {
                            closed += 1;
                        }
                    }
                    Err(e) => tracing::warn!("Failed to encode CLOSE: {}", e),
                }
            }
        }
        if closed > 0 {
            metrics::counter!("pool_frames_sent_total", "frame" => "CLOSE").increment(closed);
            tracing::debug!("Closed {} subscriptions matching {:?}", closed, prefixes);
        }
    }

    fn handle_event(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::Socket(event) => self.handle_socket_event(event),
            PoolEvent::EphemeralExpired { url, token } => {
                if self.registry.expire_ephemeral(&url, token) {
                    metrics::counter!("pool_ephemeral_evictions_total").increment(1);
                    tracing::debug!("Evicted ephemeral connection to {}", url);
                }
            }
        }
    }

    fn handle_socket_event(&mut self, event: SocketEvent) {
        let Some(conn) = self.registry.get_mut(&event.key) else {
            return;
        };
        let connecting_for = conn.connecting_for();
        if !conn.apply(&event) {
            return;
        }
        let url = conn.url().clone();
        let partition = event.key.partition().as_str();

        match event.kind {
            SocketEventKind::Connected => {
                self.stats.record_connect(&url);
                metrics::counter!("pool_connects_total", "partition" => partition).increment(1);
                if let Some(elapsed) = connecting_for {
                    metrics::histogram!("pool_connect_duration_seconds").record(elapsed.as_secs_f64());
                }
                tracing::debug!("Connected {}", event.key);
            }
            SocketEventKind::ConnectFailed(e) => {
                metrics::counter!("pool_connect_failures_total", "partition" => partition).increment(1);
                tracing::warn!("Failed to connect {}: {}", event.key, e);
                let stats = self.stats.record_error(&url, &e.to_string());
                if self.policy.should_penalize(stats, self.registry.is_own_relay(&url))
                    && self.router.penalize(url.clone())
                {
                    tracing::warn!(
                        "Penalized {} after {} failed connects",
                        url,
                        stats.consecutive_errors
                    );
                }
            }
            SocketEventKind::Message(text) => {
                self.stats.record_message(&url);
                metrics::counter!("pool_messages_received_total", "partition" => partition).increment(1);
                if RelayFrame::label(&text) == Some("CLOSED")
                    && let Ok(RelayFrame::Closed {
                        subscription_id,
                        message,
                    }) = RelayFrame::parse(&text)
                {
                    tracing::debug!("{} closed {}: {}", event.key, subscription_id, message);
                    if let Some(conn) = self.registry.get_mut(&event.key) {
                        conn.remove_subscription(&subscription_id);
                    }
                }
                self.handler.on_message(&url, &text);
            }
            SocketEventKind::Pong => {}
            SocketEventKind::Disconnected(reason) => {
                self.stats.record_error(&url, &reason.to_string());
                metrics::counter!("pool_disconnects_total", "partition" => partition).increment(1);
                tracing::info!("Disconnected {}: {}", event.key, reason);
            }
        }
    }

    fn snapshot(&self) -> PoolSnapshot {
        let preferred = self.router.preferred_relays();
        PoolSnapshot {
            connections: self.registry.iter_all().map(ConnectionInfo::from).collect(),
            penalty_box: self.router.penalty_box().iter().cloned().collect(),
            stats: self
                .stats
                .iter()
                .map(|(url, stats)| (url.clone(), stats.clone()))
                .collect(),
            preferred_find_relays: preferred.map_or(0, |p| p.find_events_relays.len()),
            preferred_reach_relays: preferred.map_or(0, |p| p.reach_user_relays.len()),
            keepalive_armed: self.supervisor.keepalive_armed,
        }
    }

    fn publish_status(&self) {
        for partition in Partition::ALL {
            metrics::gauge!("pool_connections", "partition" => partition.as_str())
                .set(self.registry.len(partition) as f64);
            metrics::gauge!("pool_connections_connected", "partition" => partition.as_str())
                .set(self.registry.connected_count(partition) as f64);
        }

        let status = PoolStatus {
            primary_connected: self.registry.connected_count(Partition::Primary),
            outbox_connected: self.registry.connected_count(Partition::Outbox),
            ephemeral_connected: self.registry.connected_count(Partition::Ephemeral),
            service_connected: self.registry.connected_count(Partition::Service),
            connected_urls: [Partition::Primary, Partition::Outbox, Partition::Ephemeral]
                .into_iter()
                .flat_map(|p| self.registry.iter(p))
                .filter(|c| c.is_connected())
                .map(|c| c.url().clone())
                .collect(),
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use nostr::{EventBuilder, Filter, Keys, Kind, PublicKey, Tag, Timestamp};
    use parking_lot::Mutex;
    use std::time::Duration;

    type Inbox = Arc<Mutex<Vec<(String, String)>>>;

    fn url(s: &str) -> CanonicalRelayUrl {
        CanonicalRelayUrl::parse(s).unwrap()
    }

    fn test_config() -> PoolConfig {
        PoolConfig {
            skip_top_relays: 0,
            special_purpose_relays: Vec::new(),
            popular_relays: Vec::new(),
            ..Default::default()
        }
    }

    fn pool_with(config: PoolConfig) -> (RelayPool, MockTransport, Inbox) {
        let transport = MockTransport::new();
        let inbox: Inbox = Arc::default();
        let sink = Arc::clone(&inbox);
        let pool = RelayPool::with_transport(
            config,
            Arc::new(transport.clone()),
            move |relay: &CanonicalRelayUrl, raw: &str| {
                sink.lock().push((relay.to_string(), raw.to_string()));
            },
        )
        .unwrap();
        (pool, transport, inbox)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn relay_list(keys: &Keys, relays: &[(&str, &str)]) -> Event {
        EventBuilder::new(Kind::RelayList, "")
            .tags(relays.iter().map(|(u, m)| Tag::parse(["r", *u, *m]).unwrap()))
            .custom_created_at(Timestamp::from(1_700_000_000))
            .sign_with_keys(keys)
            .unwrap()
    }

    fn notes_from(pubkey: PublicKey) -> Vec<Filter> {
        vec![Filter::new().author(pubkey).kind(Kind::TextNote)]
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_is_rejected() {
        let config = PoolConfig {
            stale_after: Duration::from_secs(10),
            ..test_config()
        };
        let result = RelayPool::with_transport(
            config,
            Arc::new(MockTransport::new()),
            |_: &CanonicalRelayUrl, _: &str| {},
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_all_isolates_failures_and_delivers_messages() {
        let (pool, transport, inbox) = pool_with(test_config());
        for i in 0..4 {
            pool.add_relay(RelayEndpoint::new(url(&format!("wss://r{i}.example.com")), Capabilities::READ))
                .unwrap();
        }
        transport.fail("wss://r2.example.com");

        pool.connect_all(true).unwrap();
        settle().await;

        let status = pool.status();
        assert!(status.any_connected());
        assert_eq!(status.primary_connected, 3);
        assert!(pool.is_url_connected(&url("wss://r0.example.com")));
        assert!(!pool.is_url_connected(&url("wss://r2.example.com")));

        assert!(transport.push_text("wss://r1.example.com", r#"["NOTICE","hello"]"#));
        settle().await;
        assert_eq!(
            inbox.lock().as_slice(),
            &[("wss://r1.example.com".to_string(), r#"["NOTICE","hello"]"#.to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pools_are_independent() {
        let (a, _ta, _) = pool_with(test_config());
        let (b, _tb, _) = pool_with(test_config());
        a.add_relay(RelayEndpoint::new(url("wss://a.example.com"), Capabilities::READ)).unwrap();

        assert_eq!(a.snapshot().await.unwrap().connections.len(), 1);
        assert!(b.snapshot().await.unwrap().connections.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_the_handle() {
        let (pool, _t, _) = pool_with(test_config());
        pool.shutdown().await.unwrap();
        settle().await;
        assert!(matches!(pool.connect_all(false), Err(Error::PoolClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_reconnects_dropped_relay() {
        let (pool, transport, _) = pool_with(test_config());
        pool.add_relay(RelayEndpoint::new(url("wss://a.example.com"), Capabilities::READ_WRITE))
            .unwrap();
        pool.connect_all(false).unwrap();
        settle().await;
        assert_eq!(transport.attempts("wss://a.example.com"), 1);

        transport.drop_socket("wss://a.example.com");
        settle().await;
        assert!(!pool.status().any_connected());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(transport.attempts("wss://a.example.com"), 2);
        assert!(pool.status().any_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_all_disarms_keepalive() {
        let (pool, transport, _) = pool_with(test_config());
        pool.add_relay(RelayEndpoint::new(url("wss://a.example.com"), Capabilities::READ))
            .unwrap();
        pool.connect_all(false).unwrap();
        settle().await;

        pool.disconnect_all().unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(transport.attempts("wss://a.example.com"), 1);
        assert!(!pool.snapshot().await.unwrap().keepalive_armed);
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_close_reaches_only_holders() {
        let (pool, transport, _) = pool_with(test_config());
        for u in ["wss://a.example.com", "wss://b.example.com"] {
            pool.add_relay(RelayEndpoint::new(url(u), Capabilities::READ)).unwrap();
        }
        pool.send(
            OutboundMessage::req("profile", vec![Filter::new().kind(Kind::Metadata)]),
            SendOptions::scoped([url("wss://a.example.com")]),
        )
        .unwrap();
        settle().await;

        let report = pool
            .send_and_report(OutboundMessage::close("profile"), SendOptions::default())
            .await
            .unwrap();
        assert_eq!(report.sent_to, vec![ConnectionKey::Primary(url("wss://a.example.com"))]);

        let report = pool
            .send_and_report(OutboundMessage::close("unknown"), SendOptions::default())
            .await
            .unwrap();
        assert!(report.is_empty());
        settle().await;
        assert_eq!(transport.attempts("wss://b.example.com"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_closed_forgets_subscription() {
        let (pool, transport, inbox) = pool_with(test_config());
        pool.add_relay(RelayEndpoint::new(url("wss://a.example.com"), Capabilities::READ))
            .unwrap();
        pool.send(
            OutboundMessage::req("feed", vec![Filter::new().kind(Kind::TextNote)]),
            SendOptions::default(),
        )
        .unwrap();
        settle().await;

        transport.push_text("wss://a.example.com", r#"["CLOSED","feed","error: too many"]"#);
        settle().await;

        let snapshot = pool.snapshot().await.unwrap();
        let conn = snapshot
            .connection(&ConnectionKey::Primary(url("wss://a.example.com")))
            .unwrap();
        assert!(conn.subscriptions.is_empty());
        assert_eq!(inbox.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_and_forget_subscriptions_by_prefix() {
        let (pool, transport, _) = pool_with(test_config());
        pool.add_relay(RelayEndpoint::new(url("wss://a.example.com"), Capabilities::READ))
            .unwrap();
        for id in ["Following-1", "List-2", "Notifications", "profile"] {
            pool.send(
                OutboundMessage::req(id, vec![Filter::new().kind(Kind::TextNote)]),
                SendOptions::default(),
            )
            .unwrap();
        }
        settle().await;

        pool.remove_subscriptions_with_prefixes(vec!["Following-".into(), "List-".into()])
            .unwrap();
        pool.forget_subscriptions_with_prefix("Notif").unwrap();
        settle().await;

        let sent = transport.sent_texts("wss://a.example.com");
        assert!(sent.contains(&r#"["CLOSE","Following-1"]"#.to_string()));
        assert!(sent.contains(&r#"["CLOSE","List-2"]"#.to_string()));
        assert!(!sent.iter().any(|s| s.contains(r#"["CLOSE","Notifications"]"#)));

        let snapshot = pool.snapshot().await.unwrap();
        let conn = snapshot
            .connection(&ConnectionKey::Primary(url("wss://a.example.com")))
            .unwrap();
        assert_eq!(conn.subscriptions, vec!["profile".to_string()]);
    }

    // =========================================================================
    // Outbox routing
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_find_skips_relays_we_already_read() {
        let (pool, transport, _) = pool_with(test_config());
        let p = Keys::generate();
        pool.add_relay(RelayEndpoint::new(url("wss://x.example.com"), Capabilities::READ))
            .unwrap();
        pool.set_preferred_relays(vec![relay_list(
            &p,
            &[("wss://x.example.com", "write"), ("wss://y.example.com", "write")],
        )])
        .unwrap();

        let report = pool
            .send_and_report(
                OutboundMessage::req("Following-notes", notes_from(p.public_key())),
                SendOptions::default(),
            )
            .await
            .unwrap();

        let outbox: Vec<_> = report
            .sent_to
            .iter()
            .filter(|k| k.partition() == Partition::Outbox)
            .cloned()
            .collect();
        assert_eq!(outbox, vec![ConnectionKey::Outbox(url("wss://y.example.com"))]);

        settle().await;
        assert_eq!(pool.status().outbox_connected, 1);
        assert_eq!(transport.sent_texts("wss://y.example.com").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_outbox_connections_are_pruned() {
        let config = PoolConfig {
            outbox_idle_after: Duration::from_secs(120),
            ..test_config()
        };
        let (pool, _transport, _) = pool_with(config);
        let p = Keys::generate();
        let q = Keys::generate();
        let r = Keys::generate();
        pool.set_preferred_relays(vec![
            relay_list(&p, &[("wss://y.example.com", "write")]),
            relay_list(&q, &[("wss://z.example.com", "write")]),
            relay_list(&r, &[("wss://w.example.com", "write")]),
        ])
        .unwrap();

        for (id, keys) in [("a", &p), ("b", &q), ("c", &r)] {
            pool.send(OutboundMessage::req(id, notes_from(keys.public_key())), SendOptions::default())
                .unwrap();
        }
        settle().await;
        assert_eq!(pool.status().outbox_connected, 3);

        pool.close_subscription("a").unwrap();
        pool.close_subscription("c").unwrap();
        pool.penalize(url("wss://y.example.com")).unwrap();
        tokio::time::sleep(Duration::from_secs(160)).await;

        let snapshot = pool.snapshot().await.unwrap();
        assert!(snapshot.connection(&ConnectionKey::Outbox(url("wss://y.example.com"))).is_none());
        assert!(snapshot.connection(&ConnectionKey::Outbox(url("wss://w.example.com"))).is_none());
        assert!(snapshot.connection(&ConnectionKey::Outbox(url("wss://z.example.com"))).is_some());
        // Penalized relays keep their history
        assert!(snapshot.stats.contains_key(&url("wss://y.example.com")));
        assert!(snapshot.stats.contains_key(&url("wss://z.example.com")));
        assert!(!snapshot.stats.contains_key(&url("wss://w.example.com")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_outbox_relay_is_penalized() {
        let config = PoolConfig {
            penalty_min_errors: 1,
            ..test_config()
        };
        let (pool, transport, _) = pool_with(config);
        let p = Keys::generate();
        let q = Keys::generate();
        pool.set_preferred_relays(vec![
            relay_list(&p, &[("wss://dead.example.com", "write"), ("wss://ok.example.com", "write")]),
            relay_list(&q, &[("wss://dead.example.com", "write")]),
        ])
        .unwrap();
        transport.fail("wss://dead.example.com");

        let filters = vec![Filter::new().authors([p.public_key(), q.public_key()]).kind(Kind::TextNote)];
        let first = pool
            .send_and_report(OutboundMessage::req("sub-1", filters.clone()), SendOptions::default())
            .await
            .unwrap();
        assert_eq!(first.sent_to, vec![ConnectionKey::Outbox(url("wss://dead.example.com"))]);
        settle().await;

        let snapshot = pool.snapshot().await.unwrap();
        assert_eq!(snapshot.penalty_box, vec![url("wss://dead.example.com")]);
        assert_eq!(snapshot.stats[&url("wss://dead.example.com")].connects, 0);

        let second = pool
            .send_and_report(OutboundMessage::req("sub-2", filters), SendOptions::default())
            .await
            .unwrap();
        assert_eq!(second.sent_to, vec![ConnectionKey::Outbox(url("wss://ok.example.com"))]);

        pool.release(url("wss://dead.example.com")).unwrap();
        assert!(pool.snapshot().await.unwrap().penalty_box.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_relays_are_never_penalized() {
        let config = PoolConfig {
            penalty_min_errors: 1,
            ..test_config()
        };
        let (pool, transport, _) = pool_with(config);
        pool.add_relay(RelayEndpoint::new(url("wss://mine.example.com"), Capabilities::READ))
            .unwrap();
        transport.fail("wss://mine.example.com");
        pool.connect_all(false).unwrap();
        settle().await;

        let snapshot = pool.snapshot().await.unwrap();
        assert!(snapshot.penalty_box.is_empty());
        assert_eq!(snapshot.stats[&url("wss://mine.example.com")].errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_data_mode_disables_outbox() {
        let (pool, _t, _) = pool_with(test_config());
        let p = Keys::generate();
        pool.set_preferred_relays(vec![relay_list(&p, &[("wss://y.example.com", "write")])])
            .unwrap();
        pool.set_low_data_mode(true).unwrap();

        let report = pool
            .send_and_report(
                OutboundMessage::req("Following-notes", notes_from(p.public_key())),
                SendOptions::default(),
            )
            .await
            .unwrap();
        assert!(report.is_empty());
    }

    // =========================================================================
    // Ephemeral connections
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_ephemeral_connection_is_evicted() {
        let (pool, transport, _) = pool_with(test_config());
        pool.send_ephemeral(
            "wss://hint.example.com/",
            OutboundMessage::req("lookup", vec![Filter::new().kind(Kind::Metadata)]),
        )
        .unwrap();
        settle().await;

        let key = ConnectionKey::Ephemeral(url("wss://hint.example.com"));
        let snapshot = pool.snapshot().await.unwrap();
        assert_eq!(snapshot.connection(&key).map(|c| c.subscriptions.clone()), Some(vec!["lookup".to_string()]));
        assert_eq!(transport.sent_texts("wss://hint.example.com").len(), 1);

        tokio::time::sleep(Duration::from_secs(36)).await;
        assert!(pool.snapshot().await.unwrap().connection(&key).is_none());
        assert!(!pool.is_url_connected(&url("wss://hint.example.com")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ephemeral_rejects_blocked_urls() {
        let (pool, _t, _) = pool_with(test_config());
        let msg = OutboundMessage::req("lookup", vec![Filter::new().kind(Kind::Metadata)]);
        assert!(pool.send_ephemeral("ws://localhost:7777", msg.clone()).is_err());
        assert!(pool.send_ephemeral("https://example.com", msg).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_vpn_guard_refuses_ephemeral_until_vpn_detected() {
        let config = PoolConfig {
            vpn_guard: true,
            ..test_config()
        };
        let (pool, transport, _) = pool_with(config);
        let msg = OutboundMessage::req("lookup", vec![Filter::new().kind(Kind::Metadata)]);

        pool.send_ephemeral("wss://hint.example.com", msg.clone()).unwrap();
        settle().await;
        assert_eq!(transport.attempts("wss://hint.example.com"), 0);

        pool.set_vpn_detected(true).unwrap();
        pool.send_ephemeral("wss://hint.example.com", msg).unwrap();
        settle().await;
        assert_eq!(transport.attempts("wss://hint.example.com"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_by_url_prefers_primary() {
        let (pool, _t, _) = pool_with(test_config());
        pool.add_relay(RelayEndpoint::new(url("wss://a.example.com"), Capabilities::READ))
            .unwrap();
        pool.send_ephemeral(
            "wss://a.example.com",
            OutboundMessage::req("lookup", vec![Filter::new().kind(Kind::Metadata)]),
        )
        .unwrap();

        let info = pool
            .connection_by_url(url("wss://a.example.com"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.category, ConnectionCategory::Normal);
        assert!(pool.connection_by_url(url("wss://none.example.com")).await.unwrap().is_none());
    }

    // =========================================================================
    // Service channels
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_service_channel_lifecycle() {
        let (pool, transport, _) = pool_with(test_config());
        pool.add_service_connection("wallet", url("wss://nwc.example.com"), ServiceKind::Nwc)
            .unwrap();

        let report = pool
            .send_and_report(
                OutboundMessage::req("nwc", vec![Filter::new().kind(Kind::WalletConnectResponse)])
                    .with_target(outpost_core::MessageTarget::NwcOnly),
                SendOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(report.sent_to, vec![ConnectionKey::Service("wallet".to_string())]);
        settle().await;
        assert_eq!(pool.status().service_connected, 1);
        assert_eq!(transport.sent_texts("wss://nwc.example.com").len(), 1);

        pool.remove_service_connection("wallet").unwrap();
        assert_eq!(pool.snapshot().await.unwrap().count(Partition::Service), 0);
    }
}
