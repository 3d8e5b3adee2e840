//! The four connection partitions.
//!
//! | Partition | Key            | Lifecycle                                      |
//! |-----------|----------------|------------------------------------------------|
//! | primary   | canonical URL  | the user's relays, kept alive by the supervisor |
//! | outbox    | canonical URL  | opened on demand by outbox routing             |
//! | ephemeral | canonical URL  | one-off lookups, evicted after a fixed TTL     |
//! | service   | connection id  | wallet connect / remote signer channels        |
//!
//! A relay may appear in several partitions at once; each entry is its own
//! [`Connection`] with its own socket.

use std::collections::HashMap;
use std::time::Duration;

use outpost_core::{CanonicalRelayUrl, RelayEndpoint};
use tokio::time::Instant;

use crate::connection::{
    Backoff, Connection, ConnectionCategory, ConnectionKey, Partition, SocketLink, SocketState,
};
use crate::scheduler::{PoolEvent, Scheduler};

/// Owns every connection of one pool.
pub(crate) struct ConnectionRegistry {
    primary: HashMap<ConnectionKey, Connection>,
    outbox: HashMap<ConnectionKey, Connection>,
    ephemeral: HashMap<ConnectionKey, Connection>,
    service: HashMap<ConnectionKey, Connection>,
    /// Current expiry token per ephemeral URL. A timer whose token no longer
    /// matches has been superseded and does nothing.
    ephemeral_tokens: HashMap<CanonicalRelayUrl, u64>,
    next_token: u64,
    ephemeral_ttl: Duration,
    backoff_base: Duration,
    backoff_max: Duration,
    link: SocketLink,
    scheduler: Scheduler,
}

impl ConnectionRegistry {
    pub(crate) fn new(
        link: SocketLink,
        scheduler: Scheduler,
        ephemeral_ttl: Duration,
        backoff_base: Duration,
        backoff_max: Duration,
    ) -> Self {
        Self {
            primary: HashMap::new(),
            outbox: HashMap::new(),
            ephemeral: HashMap::new(),
            service: HashMap::new(),
            ephemeral_tokens: HashMap::new(),
            next_token: 0,
            ephemeral_ttl,
            backoff_base,
            backoff_max,
            link,
            scheduler,
        }
    }

    fn map(&self, partition: Partition) -> &HashMap<ConnectionKey, Connection> {
        match partition {
            Partition::Primary => &self.primary,
            Partition::Outbox => &self.outbox,
            Partition::Ephemeral => &self.ephemeral,
            Partition::Service => &self.service,
        }
    }

    fn map_mut(&mut self, partition: Partition) -> &mut HashMap<ConnectionKey, Connection> {
        match partition {
            Partition::Primary => &mut self.primary,
            Partition::Outbox => &mut self.outbox,
            Partition::Ephemeral => &mut self.ephemeral,
            Partition::Service => &mut self.service,
        }
    }

    /// Split borrow: one partition mutably plus the socket link.
    fn parts(&mut self, partition: Partition) -> (&mut HashMap<ConnectionKey, Connection>, &SocketLink) {
        match partition {
            Partition::Primary => (&mut self.primary, &self.link),
            Partition::Outbox => (&mut self.outbox, &self.link),
            Partition::Ephemeral => (&mut self.ephemeral, &self.link),
            Partition::Service => (&mut self.service, &self.link),
        }
    }

    /// Primary connection for `endpoint`, created if needed.
    pub(crate) fn get_or_create_primary(&mut self, endpoint: RelayEndpoint) -> &mut Connection {
        let key = ConnectionKey::Primary(endpoint.url.clone());
        self.get_or_create_relay(key, endpoint, ConnectionCategory::Normal)
    }

    /// Outbox connection for `endpoint`, created if needed.
    pub(crate) fn get_or_create_outbox(&mut self, endpoint: RelayEndpoint) -> &mut Connection {
        let key = ConnectionKey::Outbox(endpoint.url.clone());
        self.get_or_create_relay(key, endpoint, ConnectionCategory::Outbox)
    }

    /// Ephemeral connection for `endpoint`, created if needed. Every call
    /// (re)starts the time to live.
    pub(crate) fn get_or_create_ephemeral(&mut self, endpoint: RelayEndpoint) -> &mut Connection {
        self.arm_ephemeral_expiry(&endpoint.url);
        let key = ConnectionKey::Ephemeral(endpoint.url.clone());
        self.get_or_create_relay(key, endpoint, ConnectionCategory::Ephemeral)
    }

    /// An existing connection keeps its identity; the endpoint's capabilities
    /// are OR'd into it.
    fn get_or_create_relay(
        &mut self,
        key: ConnectionKey,
        endpoint: RelayEndpoint,
        category: ConnectionCategory,
    ) -> &mut Connection {
        let backoff = Backoff::new(self.backoff_base, self.backoff_max);
        self.map_mut(key.partition())
            .entry(key.clone())
            .and_modify(|existing| {
                if existing.endpoint_mut().merge_capabilities(&endpoint) {
                    tracing::debug!("Upgraded capabilities of {}", existing.key());
                }
            })
            .or_insert_with(|| {
                tracing::debug!("Registered {}", key);
                Connection::new(key.clone(), endpoint, category, backoff)
            })
    }

    /// Return the service channel `id`, creating it if needed.
    pub(crate) fn get_or_create_service(
        &mut self,
        id: &str,
        url: CanonicalRelayUrl,
        category: ConnectionCategory,
    ) -> &mut Connection {
        let key = ConnectionKey::Service(id.to_string());
        let backoff = Backoff::new(self.backoff_base, self.backoff_max);
        self.service
            .entry(key.clone())
            .or_insert_with(|| Connection::new(key, RelayEndpoint::service(url), category, backoff))
    }

    fn arm_ephemeral_expiry(&mut self, url: &CanonicalRelayUrl) {
        self.next_token += 1;
        let token = self.next_token;
        self.ephemeral_tokens.insert(url.clone(), token);
        self.scheduler.schedule(
            self.ephemeral_ttl,
            PoolEvent::EphemeralExpired {
                url: url.clone(),
                token,
            },
        );
    }

    /// Handle an ephemeral timer. Evicts the connection only if `token` is still current.
    pub(crate) fn expire_ephemeral(&mut self, url: &CanonicalRelayUrl, token: u64) -> bool {
        if self.ephemeral_tokens.get(url) != Some(&token) {
            return false;
        }
        self.remove(&ConnectionKey::Ephemeral(url.clone()))
    }

    /// Remove the idle connections of `partition`, returning their URLs.
    pub(crate) fn prune_idle(
        &mut self,
        partition: Partition,
        now: Instant,
        idle_after: Duration,
    ) -> Vec<CanonicalRelayUrl> {
        let idle: Vec<ConnectionKey> = self
            .iter(partition)
            .filter(|c| c.is_idle(now, idle_after))
            .map(|c| c.key().clone())
            .collect();
        idle.into_iter()
            .filter_map(|key| {
                let url = self.get(&key)?.url().clone();
                self.remove(&key).then_some(url)
            })
            .collect()
    }

    /// Disconnect and forget a connection.
    pub(crate) fn remove(&mut self, key: &ConnectionKey) -> bool {
        if let ConnectionKey::Ephemeral(url) = key {
            self.ephemeral_tokens.remove(url);
        }
        match self.map_mut(key.partition()).remove(key) {
            Some(mut conn) => {
                conn.disconnect();
                tracing::debug!("Removed {}", key);
                true
            }
            None => false,
        }
    }

    pub(crate) fn get(&self, key: &ConnectionKey) -> Option<&Connection> {
        self.map(key.partition()).get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &ConnectionKey) -> Option<&mut Connection> {
        self.map_mut(key.partition()).get_mut(key)
    }

    /// Start a handshake on one connection. See [`Connection::connect`].
    pub(crate) fn connect(&mut self, key: &ConnectionKey) -> bool {
        let (map, link) = self.parts(key.partition());
        map.get_mut(key).is_some_and(|conn| conn.connect(link))
    }

    pub(crate) fn disconnect(&mut self, key: &ConnectionKey) {
        if let Some(conn) = self.get_mut(key) {
            conn.disconnect();
        }
    }

    /// Connect every connection in `partition` accepted by `filter`.
    ///
    /// Each handshake runs in its own task, so one relay failing never holds
    /// up the others. Returns the number of handshakes started.
    pub(crate) fn connect_all(
        &mut self,
        partition: Partition,
        reset_backoff: bool,
        filter: impl Fn(&Connection) -> bool,
    ) -> usize {
        let (map, link) = self.parts(partition);
        let mut started = 0;
        for conn in map.values_mut().filter(|c| filter(c)) {
            if reset_backoff {
                conn.reset_backoff();
            }
            if conn.connect(link) {
                started += 1;
            }
        }
        started
    }

    pub(crate) fn disconnect_all(&mut self, partition: Partition) {
        for conn in self.map_mut(partition).values_mut() {
            conn.disconnect();
        }
    }

    pub(crate) fn iter(&self, partition: Partition) -> impl Iterator<Item = &Connection> {
        self.map(partition).values()
    }

    pub(crate) fn iter_mut(&mut self, partition: Partition) -> impl Iterator<Item = &mut Connection> {
        self.map_mut(partition).values_mut()
    }

    /// Every connection in every partition.
    pub(crate) fn iter_all_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.primary
            .values_mut()
            .chain(self.outbox.values_mut())
            .chain(self.ephemeral.values_mut())
            .chain(self.service.values_mut())
    }

    pub(crate) fn iter_all(&self) -> impl Iterator<Item = &Connection> {
        self.primary
            .values()
            .chain(self.outbox.values())
            .chain(self.ephemeral.values())
            .chain(self.service.values())
    }

    pub(crate) fn keys(&self, partition: Partition) -> Vec<ConnectionKey> {
        self.map(partition).keys().cloned().collect()
    }

    pub(crate) fn len(&self, partition: Partition) -> usize {
        self.map(partition).len()
    }

    pub(crate) fn connected_count(&self, partition: Partition) -> usize {
        self.iter(partition).filter(|c| c.state() == SocketState::Connected).count()
    }

    /// First connection for `url`, looking at primary, then outbox, then ephemeral.
    pub(crate) fn connection_by_url(&self, url: &CanonicalRelayUrl) -> Option<&Connection> {
        [Partition::Primary, Partition::Outbox, Partition::Ephemeral]
            .into_iter()
            .filter_map(|p| ConnectionKey::for_url(p, url.clone()))
            .find_map(|key| self.get(&key))
    }

    /// Whether `url` is part of the user's own read/write relay set.
    pub(crate) fn is_own_relay(&self, url: &CanonicalRelayUrl) -> bool {
        self.primary
            .get(&ConnectionKey::Primary(url.clone()))
            .is_some_and(|c| c.endpoint().should_connect())
    }
}
