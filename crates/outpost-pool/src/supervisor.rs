//! Keepalive for the user's own relays.
//!
//! On each tick, every primary connection that should be up is checked:
//! a silent one is pinged, one that stayed silent through the pings is torn
//! down, and one without a liveness timestamp is (re)connected. Reconnects
//! respect the connection's backoff.

use std::time::Duration;

use tokio::time::Instant;

use crate::connection::{ConnectionKey, Partition};
use crate::registry::ConnectionRegistry;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub pinged: Vec<ConnectionKey>,
    pub dropped_stale: Vec<ConnectionKey>,
    pub reconnecting: Vec<ConnectionKey>,
}

enum Action {
    Ping,
    Drop,
    Reconnect,
}

#[derive(Debug, Clone)]
pub(crate) struct Supervisor {
    /// Armed by connect-all, disarmed by disconnect-all.
    pub(crate) keepalive_armed: bool,
    pub(crate) foreground: bool,
    pub(crate) network_reachable: bool,
    ping_after: Duration,
    stale_after: Duration,
}

impl Supervisor {
    pub(crate) fn new(ping_after: Duration, stale_after: Duration) -> Self {
        Self {
            keepalive_armed: false,
            foreground: true,
            network_reachable: true,
            ping_after,
            stale_after,
        }
    }

    pub(crate) fn active(&self) -> bool {
        self.keepalive_armed && self.foreground && self.network_reachable
    }

    pub(crate) fn tick(&self, registry: &mut ConnectionRegistry, now: Instant) -> TickReport {
        let mut report = TickReport::default();
        if !self.active() {
            return report;
        }
        metrics::counter!("pool_keepalive_ticks_total").increment(1);

        let actions: Vec<(ConnectionKey, Action)> = registry
            .iter(Partition::Primary)
            .filter(|c| c.endpoint().should_connect())
            .filter_map(|c| {
                let action = match c.last_message_received_at() {
                    None => Action::Reconnect,
                    Some(last) if c.is_connected() => {
                        let silent = now.saturating_duration_since(last);
                        if silent >= self.stale_after {
                            Action::Drop
                        } else if silent >= self.ping_after {
                            Action::Ping
                        } else {
                            return None;
                        }
                    }
                    Some(_) => return None,
                };
                Some((c.key().clone(), action))
            })
            .collect();

        for (key, action) in actions {
            match action {
                Action::Ping => {
                    if registry.get_mut(&key).is_some_and(|c| c.ping()) {
                        metrics::counter!("pool_keepalive_pings_total").increment(1);
                        report.pinged.push(key);
                    }
                }
                Action::Drop => {
                    tracing::info!("Dropping {}: no traffic for {:?}", key, self.stale_after);
                    registry.disconnect(&key);
                    report.dropped_stale.push(key);
                }
                Action::Reconnect => {
                    if registry.connect(&key) {
                        metrics::counter!("pool_keepalive_reconnects_total").increment(1);
                        report.reconnecting.push(key);
                    }
                }
            }
        }

        if !report.reconnecting.is_empty() || !report.dropped_stale.is_empty() {
            tracing::debug!(
                "Keepalive: {} pinged, {} dropped, {} reconnecting",
                report.pinged.len(),
                report.dropped_stale.len(),
                report.reconnecting.len()
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::{registry, settle, url};
    use outpost_core::{Capabilities, RelayEndpoint};

    fn supervisor() -> Supervisor {
        let mut s = Supervisor::new(Duration::from_secs(45), Duration::from_secs(120));
        s.keepalive_armed = true;
        s
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_when_disarmed_backgrounded_or_offline() {
        let (mut reg, _t, _rx) = registry();
        reg.get_or_create_primary(RelayEndpoint::new(url("wss://a.example.com"), Capabilities::READ));

        let mut s = Supervisor::new(Duration::from_secs(45), Duration::from_secs(120));
        assert_eq!(s.tick(&mut reg, Instant::now()), TickReport::default());

        s.keepalive_armed = true;
        s.foreground = false;
        assert_eq!(s.tick(&mut reg, Instant::now()), TickReport::default());

        s.foreground = true;
        s.network_reachable = false;
        assert_eq!(s.tick(&mut reg, Instant::now()), TickReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_never_connected_relays() {
        let (mut reg, _t, mut rx) = registry();
        reg.get_or_create_primary(RelayEndpoint::new(url("wss://a.example.com"), Capabilities::READ));
        // Neither read nor write: never kept alive
        reg.get_or_create_primary(RelayEndpoint::new(url("wss://idle.example.com"), Capabilities::default()));

        let report = supervisor().tick(&mut reg, Instant::now());
        assert_eq!(report.reconnecting, vec![ConnectionKey::Primary(url("wss://a.example.com"))]);

        settle(&mut reg, &mut rx).await;
        assert_eq!(reg.connected_count(Partition::Primary), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pings_silent_relays_then_drops_stale_ones() {
        let (mut reg, transport, mut rx) = registry();
        let key = ConnectionKey::Primary(url("wss://a.example.com"));
        reg.get_or_create_primary(RelayEndpoint::new(url("wss://a.example.com"), Capabilities::READ));
        reg.connect(&key);
        settle(&mut reg, &mut rx).await;
        let s = supervisor();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(s.tick(&mut reg, Instant::now()), TickReport::default());

        tokio::time::sleep(Duration::from_secs(20)).await;
        let report = s.tick(&mut reg, Instant::now());
        assert_eq!(report.pinged, vec![key.clone()]);
        settle(&mut reg, &mut rx).await;
        assert_eq!(transport.pings("wss://a.example.com"), 1);

        // The mock never answers pings
        tokio::time::sleep(Duration::from_secs(80)).await;
        let report = s.tick(&mut reg, Instant::now());
        assert_eq!(report.dropped_stale, vec![key.clone()]);
        assert!(!reg.get(&key).unwrap().is_connected());

        // Next tick brings it back
        let report = s.tick(&mut reg, Instant::now());
        assert_eq!(report.reconnecting, vec![key]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_respects_backoff() {
        let (mut reg, transport, mut rx) = registry();
        let key = ConnectionKey::Primary(url("wss://down.example.com"));
        reg.get_or_create_primary(RelayEndpoint::new(url("wss://down.example.com"), Capabilities::READ));
        transport.fail("wss://down.example.com");
        let s = supervisor();

        assert_eq!(s.tick(&mut reg, Instant::now()).reconnecting, vec![key.clone()]);
        settle(&mut reg, &mut rx).await;
        assert_eq!(reg.get(&key).unwrap().backoff().failures(), 1);

        // Still inside the 2s backoff window
        assert!(s.tick(&mut reg, Instant::now()).reconnecting.is_empty());
        assert_eq!(transport.attempts("wss://down.example.com"), 1);
    }
}
