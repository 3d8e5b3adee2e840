//! Events flowing back into the pool actor, and the timer that produces some of them.

use std::time::Duration;

use outpost_core::CanonicalRelayUrl;
use tokio::sync::mpsc;

use crate::connection::SocketEvent;

/// Everything the pool actor reacts to besides caller commands.
#[derive(Debug)]
pub(crate) enum PoolEvent {
    /// A socket task reported progress.
    Socket(SocketEvent),
    /// The time to live of an ephemeral connection ran out.
    EphemeralExpired { url: CanonicalRelayUrl, token: u64 },
}

/// Issues delayed [`PoolEvent`]s.
///
/// Timers never touch pool state themselves. They only post an event, and the
/// actor decides whether it still applies.
#[derive(Debug, Clone)]
pub(crate) struct Scheduler {
    events: mpsc::UnboundedSender<PoolEvent>,
}

impl Scheduler {
    pub(crate) fn new(events: mpsc::UnboundedSender<PoolEvent>) -> Self {
        Self { events }
    }

    pub(crate) fn schedule(&self, after: Duration, event: PoolEvent) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            // Pool gone means nobody cares any more
            let _ = events.send(event);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_schedule_fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(tx);
        let url = CanonicalRelayUrl::parse("wss://relay.example.com").unwrap();

        scheduler.schedule(
            Duration::from_secs(35),
            PoolEvent::EphemeralExpired {
                url: url.clone(),
                token: 7,
            },
        );

        tokio::time::sleep(Duration::from_secs(34)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        match rx.try_recv() {
            Ok(PoolEvent::EphemeralExpired { url: got, token }) => {
                assert_eq!(got, url);
                assert_eq!(token, 7);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
