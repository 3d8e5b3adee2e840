//! Routes one outbound message to the connections that should see it.
//!
//! Order of evaluation:
//! 1. service channels (wallet connect / remote signer), which only take
//!    messages addressed to them;
//! 2. primary connections, filtered by relay scope and capabilities;
//! 3. outbox expansion through the [`OutboxRouter`] plans.
//!
//! CLOSE is the exception: it goes to exactly the connections, in any relay
//! partition, that hold the subscription.

use std::collections::HashSet;

use nostr::{Event, Filter, PublicKey};
use outpost_core::{
    CanonicalRelayUrl, Capabilities, ClientFrame, MessageTarget, OutboundMessage, RelayEndpoint,
    RelayType, tagged_pubkeys,
};

use crate::connection::{ConnectionCategory, ConnectionKey, Partition};
use crate::registry::ConnectionRegistry;
use crate::router::OutboxRouter;
use crate::Result;

/// Per-send options.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Only these relays. Empty means every eligible relay. A non-empty scope
    /// lets read REQs reach relays without the read flag and disables outbox
    /// expansion; EVENTs still need `write` and searches `search`.
    pub relay_scope: HashSet<CanonicalRelayUrl>,
    /// Pubkey the message is sent on behalf of, checked against endpoint exclusions.
    pub origin_pubkey: Option<PublicKey>,
}

impl SendOptions {
    pub fn scoped(relays: impl IntoIterator<Item = CanonicalRelayUrl>) -> Self {
        Self {
            relay_scope: relays.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn with_origin(mut self, pubkey: PublicKey) -> Self {
        self.origin_pubkey = Some(pubkey);
        self
    }
}

/// Where a message was queued.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent_to: Vec<ConnectionKey>,
}

impl DispatchReport {
    pub fn is_empty(&self) -> bool {
        self.sent_to.is_empty()
    }

    pub fn count(&self, partition: Partition) -> usize {
        self.sent_to.iter().filter(|k| k.partition() == partition).count()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Dispatcher {
    pub(crate) outbox_enabled: bool,
    pub(crate) low_data_mode: bool,
    pub(crate) skip_top_relays: usize,
    pub(crate) reach_excluded_kinds: HashSet<u16>,
}

impl Dispatcher {
    pub(crate) fn send(
        &self,
        registry: &mut ConnectionRegistry,
        router: &OutboxRouter,
        message: &OutboundMessage,
        options: &SendOptions,
    ) -> Result<DispatchReport> {
        let wire = message.to_wire()?;
        let mut report = DispatchReport::default();

        self.send_to_services(registry, message, options, &wire, &mut report);
        if message.target != MessageTarget::Relays {
            return Ok(report);
        }

        match &message.frame {
            ClientFrame::Close { subscription_id } => {
                close_everywhere(registry, subscription_id, &wire, &mut report);
            }
            ClientFrame::Req {
                subscription_id,
                filters,
            } => {
                self.send_to_primary(registry, message, options, &wire, &mut report);
                if self.outbox_allowed(router, options) {
                    self.expand_find(registry, router, subscription_id, filters, message.relay_type, &mut report)?;
                }
            }
            ClientFrame::Event(event) => {
                self.send_to_primary(registry, message, options, &wire, &mut report);
                if self.outbox_allowed(router, options)
                    && !self.reach_excluded_kinds.contains(&event.kind.as_u16())
                {
                    self.expand_reach(registry, router, event, &wire, &mut report);
                }
            }
        }

        tracing::debug!(
            "Dispatched {} {} to {} connections",
            message.label(),
            message.subscription_id().unwrap_or("-"),
            report.sent_to.len()
        );
        Ok(report)
    }

    fn outbox_allowed(&self, router: &OutboxRouter, options: &SendOptions) -> bool {
        self.outbox_enabled
            && !self.low_data_mode
            && options.relay_scope.is_empty()
            && router.has_preferred_relays()
    }

    fn send_to_services(
        &self,
        registry: &mut ConnectionRegistry,
        message: &OutboundMessage,
        options: &SendOptions,
        wire: &str,
        report: &mut DispatchReport,
    ) {
        let wanted = match message.target {
            MessageTarget::Relays => return,
            MessageTarget::NwcOnly => ConnectionCategory::Nwc,
            MessageTarget::NcOnly => ConnectionCategory::Nc,
        };

        for key in registry.keys(Partition::Service) {
            let Some(conn) = registry.get(&key) else {
                continue;
            };
            if conn.category() != wanted {
                continue;
            }

            match &message.frame {
                ClientFrame::Req {
                    subscription_id, ..
                } => {
                    if deliver(registry, &key, wire, message.label())
                        && let Some(conn) = registry.get_mut(&key)
                    {
                        conn.replace_subscriptions(subscription_id);
                        report.sent_to.push(key);
                    }
                }
                ClientFrame::Close { subscription_id } => {
                    if !conn.is_connected() {
                        continue;
                    }
                    if deliver(registry, &key, wire, message.label())
                        && let Some(conn) = registry.get_mut(&key)
                    {
                        conn.remove_subscription(subscription_id);
                        report.sent_to.push(key);
                    }
                }
                ClientFrame::Event(_) => {
                    let endpoint = conn.endpoint();
                    if message.relay_type == RelayType::Write && !endpoint.capabilities.write {
                        continue;
                    }
                    if endpoint.excludes(options.origin_pubkey.as_ref()) {
                        continue;
                    }
                    if deliver(registry, &key, wire, message.label()) {
                        report.sent_to.push(key);
                    }
                }
            }
        }
    }

    fn send_to_primary(
        &self,
        registry: &mut ConnectionRegistry,
        message: &OutboundMessage,
        options: &SendOptions,
        wire: &str,
        report: &mut DispatchReport,
    ) {
        let scoped = !options.relay_scope.is_empty();

        for key in registry.keys(Partition::Primary) {
            let Some(conn) = registry.get(&key) else {
                continue;
            };
            let endpoint = conn.endpoint();
            if scoped && !options.relay_scope.contains(&endpoint.url) {
                continue;
            }
            if !accepts(endpoint.capabilities, message.relay_type, scoped) {
                continue;
            }

            match &message.frame {
                ClientFrame::Req {
                    subscription_id, ..
                } => {
                    if conn.has_subscription(subscription_id) {
                        continue;
                    }
                    if deliver(registry, &key, wire, message.label())
                        && let Some(conn) = registry.get_mut(&key)
                    {
                        conn.add_subscription(subscription_id);
                        report.sent_to.push(key);
                    }
                }
                ClientFrame::Event(_) => {
                    if endpoint.excludes(options.origin_pubkey.as_ref()) {
                        continue;
                    }
                    if deliver(registry, &key, wire, message.label()) {
                        report.sent_to.push(key);
                    }
                }
                ClientFrame::Close { .. } => {}
            }
        }
    }

    fn expand_find(
        &self,
        registry: &mut ConnectionRegistry,
        router: &OutboxRouter,
        subscription_id: &str,
        filters: &[Filter],
        relay_type: RelayType,
        report: &mut DispatchReport,
    ) -> Result<()> {
        if relay_type != RelayType::Read {
            return Ok(());
        }

        let pubkeys: HashSet<PublicKey> = filters
            .iter()
            .filter_map(|f| f.authors.as_ref())
            .flatten()
            .copied()
            .collect();
        if pubkeys.is_empty() {
            return Ok(());
        }

        let our_read_relays = own_relays(registry, |caps| caps.read);
        let plan = router.plan_for_find(&pubkeys, filters, &our_read_relays, self.skip_top_relays);

        for group in plan.groups {
            let key = registry
                .get_or_create_outbox(RelayEndpoint::new(group.relay, Capabilities::READ))
                .key()
                .clone();
            if registry.get(&key).is_some_and(|c| c.has_subscription(subscription_id)) {
                continue;
            }

            let narrowed = OutboundMessage::req(subscription_id, group.filters);
            let wire = narrowed.to_wire()?;
            if deliver(registry, &key, &wire, "REQ")
                && let Some(conn) = registry.get_mut(&key)
            {
                conn.add_subscription(subscription_id);
                tracing::debug!(
                    "Outbox REQ {} to {} for {} authors",
                    subscription_id,
                    key,
                    group.pubkeys.len()
                );
                report.sent_to.push(key);
            }
        }
        Ok(())
    }

    fn expand_reach(
        &self,
        registry: &mut ConnectionRegistry,
        router: &OutboxRouter,
        event: &Event,
        wire: &str,
        report: &mut DispatchReport,
    ) {
        let pubkeys: HashSet<PublicKey> = tagged_pubkeys(event).into_iter().collect();
        if pubkeys.is_empty() {
            return;
        }

        let our_write_relays = own_relays(registry, |caps| caps.write);
        let plan = router.plan_for_reach(&pubkeys, &our_write_relays);

        for group in plan.groups {
            let key = registry
                .get_or_create_outbox(RelayEndpoint::new(group.relay, Capabilities::WRITE))
                .key()
                .clone();
            if deliver(registry, &key, wire, "EVENT") {
                tracing::debug!("Outbox EVENT {} to {} for {} readers", event.id, key, group.pubkeys.len());
                report.sent_to.push(key);
            }
        }
    }
}

/// Whether a relay with `caps` takes a message of `relay_type`. A relay scope
/// lifts the read requirement only; writes and searches still need the flag.
fn accepts(caps: Capabilities, relay_type: RelayType, scoped: bool) -> bool {
    match relay_type {
        RelayType::Read => scoped || caps.read,
        RelayType::Write => caps.write,
        RelayType::Search => caps.search,
    }
}

fn own_relays(
    registry: &ConnectionRegistry,
    wanted: impl Fn(Capabilities) -> bool,
) -> HashSet<CanonicalRelayUrl> {
    registry
        .iter(Partition::Primary)
        .filter(|c| wanted(c.endpoint().capabilities))
        .map(|c| c.url().clone())
        .collect()
}

fn close_everywhere(
    registry: &mut ConnectionRegistry,
    subscription_id: &str,
    wire: &str,
    report: &mut DispatchReport,
) {
    for partition in [Partition::Primary, Partition::Outbox, Partition::Ephemeral] {
        for conn in registry.iter_mut(partition) {
            if !conn.remove_subscription(subscription_id) {
                continue;
            }
            if conn.send_text(wire) {
                metrics::counter!("pool_frames_sent_total", "frame" => "CLOSE").increment(1);
                report.sent_to.push(conn.key().clone());
            }
        }
    }
}

/// Connect if needed, then queue `wire`. Returns false when the connection is
/// gone or backing off.
fn deliver(
    registry: &mut ConnectionRegistry,
    key: &ConnectionKey,
    wire: &str,
    label: &'static str,
) -> bool {
    registry.connect(key);
    let sent = registry.get_mut(key).is_some_and(|c| c.send_text(wire));
    if sent {
        metrics::counter!("pool_frames_sent_total", "frame" => label).increment(1);
    } else {
        tracing::debug!("Dropped frame for {}: no socket", key);
        metrics::counter!("pool_frames_dropped_total").increment(1);
    }
    sent
}
