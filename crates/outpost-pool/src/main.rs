//! Outpost follow-feed daemon.
//!
//! Connects to a set of relays, fetches the relay lists (NIP-65) of the
//! followed authors, and subscribes to their notes through the outbox model:
//! each author is asked for on the relays they write to, not only on ours.
//!
//! # Usage
//!
//! ```bash
//! # Follow two authors from two relays
//! outpost \
//!     --relays wss://relay.damus.io,wss://nos.lol \
//!     --follow npub1...,npub1...
//!
//! # Only our own relays, no outbox connections
//! outpost --relays wss://nos.lol --follow npub1... --no-outbox
//! ```
//!
//! Press Ctrl+C to stop; a per-relay summary is printed on exit.

use anyhow::{Context, Result};
use clap::Parser;
use nostr::{Event, Filter, Kind, PublicKey};
use outpost_core::metrics::{init_metrics, start_metrics_server};
use outpost_core::{CanonicalRelayUrl, Capabilities, OutboundMessage, RelayEndpoint, RelayFrame};
use outpost_pool::{PoolConfig, RelayPool, SendOptions};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const RELAY_LISTS_SUBSCRIPTION: &str = "relay-lists";
const NOTES_SUBSCRIPTION: &str = "Following-notes";

/// Outpost follow-feed daemon.
#[derive(Parser, Debug)]
#[command(name = "outpost")]
#[command(about = "Follow Nostr authors across their own relays (outbox model)")]
#[command(version)]
struct Args {
    /// Our relay URLs (comma-separated)
    #[arg(long, value_delimiter = ',', required = true)]
    relays: Vec<String>,

    /// Authors to follow, hex or npub (comma-separated)
    #[arg(long, value_delimiter = ',', required = true)]
    follow: Vec<String>,

    /// Only use our own relays
    #[arg(long)]
    no_outbox: bool,

    /// Low data mode: never open outbox connections
    #[arg(long)]
    low_data: bool,

    /// Maximum relays per outbox plan
    #[arg(long)]
    max_preferred_relays: Option<usize>,

    /// Number of most popular relays to skip when planning
    #[arg(long)]
    skip_top_relays: Option<usize>,

    /// Seconds to wait for relay lists before subscribing to notes
    #[arg(long, default_value = "5")]
    relay_list_wait: u64,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "OUTPOST_METRICS_PORT", default_value = "0")]
    metrics_port: u16,
}

/// What the inbound handler collected.
#[derive(Default)]
struct Inbox {
    relay_lists: HashMap<PublicKey, Event>,
    notes_per_relay: HashMap<String, u64>,
    notes_seen: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("outpost_pool=debug".parse()?),
        )
        .init();

    let args = Args::parse();

    tracing::info!("Outpost starting...");

    if args.metrics_port > 0 {
        let metrics_handle = init_metrics().context("Failed to install metrics recorder")?;
        start_metrics_server(args.metrics_port, metrics_handle).await?;
    }

    let mut config = PoolConfig::from_env()?;
    if args.no_outbox {
        config.outbox_enabled = false;
    }
    if args.low_data {
        config.low_data_mode = true;
    }
    if let Some(max) = args.max_preferred_relays {
        config.max_preferred_relays = max;
    }
    if let Some(skip) = args.skip_top_relays {
        config.skip_top_relays = skip;
    }

    let follows = args
        .follow
        .iter()
        .map(|s| PublicKey::parse(s.trim()).with_context(|| format!("Invalid pubkey '{}'", s)))
        .collect::<Result<Vec<_>>>()?;

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        running_clone.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    let inbox = Arc::new(Mutex::new(Inbox::default()));
    let handler_inbox = Arc::clone(&inbox);
    let pool = RelayPool::new(config, move |relay: &CanonicalRelayUrl, raw: &str| {
        handle_frame(&handler_inbox, relay, raw);
    })?;

    tracing::info!("Configuration:");
    tracing::info!("  Relays: {}", args.relays.len());
    tracing::info!("  Following: {}", follows.len());
    tracing::info!("  Outbox: {}", !args.no_outbox && !args.low_data);

    for relay in &args.relays {
        let url = CanonicalRelayUrl::parse(relay).with_context(|| format!("Invalid relay '{}'", relay))?;
        pool.add_relay(RelayEndpoint::new(url, Capabilities::READ_WRITE))?;
    }
    pool.connect_all(true)?;

    // Relay lists come from our own relays only
    let own: Vec<CanonicalRelayUrl> = args
        .relays
        .iter()
        .filter_map(|r| CanonicalRelayUrl::parse(r).ok())
        .collect();
    pool.send(
        OutboundMessage::req(
            RELAY_LISTS_SUBSCRIPTION,
            vec![Filter::new().authors(follows.iter().copied()).kind(Kind::RelayList)],
        ),
        SendOptions::scoped(own),
    )?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.relay_list_wait);
    while running.load(Ordering::SeqCst) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    pool.close_subscription(RELAY_LISTS_SUBSCRIPTION)?;

    let relay_lists: Vec<Event> = inbox.lock().relay_lists.values().cloned().collect();
    tracing::info!(
        "Received relay lists for {} of {} followed authors",
        relay_lists.len(),
        follows.len()
    );
    pool.set_preferred_relays(relay_lists)?;

    let report = pool
        .send_and_report(
            OutboundMessage::req(
                NOTES_SUBSCRIPTION,
                vec![Filter::new().authors(follows.iter().copied()).kind(Kind::TextNote).limit(20)],
            ),
            SendOptions::default(),
        )
        .await?;
    tracing::info!("Subscribed to notes on {} relays", report.sent_to.len());

    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    let snapshot = pool.snapshot().await?;
    pool.shutdown().await?;

    let inbox = inbox.lock();
    println!("\n=== Summary ===");
    println!("Notes received: {}", inbox.notes_seen);
    println!("Connections:    {}", snapshot.connections.len());
    println!("Penalized:      {}", snapshot.penalty_box.len());
    let mut per_relay: Vec<_> = inbox.notes_per_relay.iter().collect();
    per_relay.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    for (relay, count) in per_relay {
        println!("  {:>6}  {}", count, relay);
    }

    Ok(())
}

fn handle_frame(inbox: &Mutex<Inbox>, relay: &CanonicalRelayUrl, raw: &str) {
    let frame = match RelayFrame::parse(raw) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!("Ignoring frame from {}: {}", relay, e);
            return;
        }
    };

    match frame {
        RelayFrame::Event {
            subscription_id,
            event,
        } => {
            if event.verify().is_err() {
                tracing::debug!("Dropping event with bad signature from {}", relay);
                return;
            }
            let mut inbox = inbox.lock();
            match event.kind {
                Kind::RelayList if subscription_id == RELAY_LISTS_SUBSCRIPTION => {
                    let newer = inbox
                        .relay_lists
                        .get(&event.pubkey)
                        .is_none_or(|existing| existing.created_at < event.created_at);
                    if newer {
                        inbox.relay_lists.insert(event.pubkey, *event);
                    }
                }
                Kind::TextNote => {
                    inbox.notes_seen += 1;
                    *inbox.notes_per_relay.entry(relay.to_string()).or_default() += 1;
                    let preview: String = event.content.chars().take(80).collect();
                    tracing::info!("[{}] {}: {}", relay, event.pubkey, preview);
                }
                _ => {}
            }
        }
        RelayFrame::Eose { subscription_id } => {
            tracing::debug!("{} finished stored events for {}", relay, subscription_id);
        }
        RelayFrame::Notice(message) => tracing::info!("Notice from {}: {}", relay, message),
        RelayFrame::Closed {
            subscription_id,
            message,
        } => tracing::info!("{} closed {}: {}", relay, subscription_id, message),
        RelayFrame::Ok { .. } | RelayFrame::Auth(_) => {}
    }
}
