//! Outbox routing (NIP-65).
//!
//! Turns other people's relay lists into per-relay plans:
//!
//! - **find**: which relays to ask for events written by a set of authors
//!   (their *write* relays), each with filters narrowed to the authors that
//!   relay is responsible for;
//! - **reach**: which relays to deliver an event to so that the tagged people
//!   see it (their *read* relays).
//!
//! Relay lists are attacker-controlled, so the deny-list and the penalty box
//! are applied while the preferred relay map is built, and every plan is
//! capped at `max_preferred_relays` relays.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};

use nostr::{Alphabet, Event, Filter, PublicKey, SingleLetterTag};
use outpost_core::relay_list::merge_newest;
use outpost_core::{CanonicalRelayUrl, RelayList, RelayListSanitizer};

use crate::penalty::PenaltyBox;

/// Relay → pubkeys, derived from relay lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreferredRelays {
    /// Where each pubkey publishes (relay → authors writing there).
    pub find_events_relays: HashMap<CanonicalRelayUrl, HashSet<PublicKey>>,
    /// Where each pubkey reads (relay → people reading there).
    pub reach_user_relays: HashMap<CanonicalRelayUrl, HashSet<PublicKey>>,
}

/// One relay of a find plan.
#[derive(Debug, Clone, PartialEq)]
pub struct FindGroup {
    pub relay: CanonicalRelayUrl,
    pub pubkeys: BTreeSet<PublicKey>,
    /// Input filters with `authors` replaced by `pubkeys`.
    pub filters: Vec<Filter>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindPlan {
    pub groups: Vec<FindGroup>,
}

impl FindPlan {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn relays(&self) -> impl Iterator<Item = &CanonicalRelayUrl> {
        self.groups.iter().map(|g| &g.relay)
    }
}

/// One relay of a reach plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReachGroup {
    pub relay: CanonicalRelayUrl,
    pub pubkeys: BTreeSet<PublicKey>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReachPlan {
    pub groups: Vec<ReachGroup>,
}

impl ReachPlan {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn relays(&self) -> impl Iterator<Item = &CanonicalRelayUrl> {
        self.groups.iter().map(|g| &g.relay)
    }
}

/// Owns the relay list cache, the penalty box and the derived preferred relay map.
#[derive(Debug)]
pub struct OutboxRouter {
    sanitizer: RelayListSanitizer,
    deny_list: HashSet<CanonicalRelayUrl>,
    penalty_box: PenaltyBox,
    max_preferred_relays: usize,
    /// Sanitized lists, newest per author.
    lists: HashMap<PublicKey, RelayList>,
    preferred: Option<PreferredRelays>,
}

impl OutboxRouter {
    pub fn new(
        sanitizer: RelayListSanitizer,
        deny_list: HashSet<CanonicalRelayUrl>,
        max_preferred_relays: usize,
    ) -> Self {
        Self {
            sanitizer,
            deny_list,
            penalty_box: PenaltyBox::new(),
            max_preferred_relays,
            lists: HashMap::new(),
            preferred: None,
        }
    }

    /// Replace the relay list cache with `events` and rebuild the map.
    ///
    /// Malformed lists are dropped whole. Of several lists by one author the
    /// newest wins.
    pub fn set_preferred_relays<'a>(&mut self, events: impl IntoIterator<Item = &'a Event>) {
        self.lists = self.sanitizer.sanitize_all(events);
        self.rebuild();
    }

    /// Merge `events` into the cache and rebuild the map.
    pub fn add_relay_lists<'a>(&mut self, events: impl IntoIterator<Item = &'a Event>) {
        for (_, list) in self.sanitizer.sanitize_all(events) {
            merge_newest(&mut self.lists, list);
        }
        self.rebuild();
    }

    /// Rebuild the map from cached lists, after the penalty box or deny-list changed.
    pub fn reload_preferred_relays(&mut self) {
        self.rebuild();
    }

    /// Returns true if the relay was newly boxed (and the map rebuilt).
    pub fn penalize(&mut self, url: CanonicalRelayUrl) -> bool {
        let changed = self.penalty_box.insert(url);
        if changed {
            self.rebuild();
        }
        changed
    }

    /// Returns true if the relay was boxed (and the map rebuilt).
    pub fn release(&mut self, url: &CanonicalRelayUrl) -> bool {
        let changed = self.penalty_box.remove(url);
        if changed {
            self.rebuild();
        }
        changed
    }

    pub fn penalty_box(&self) -> &PenaltyBox {
        &self.penalty_box
    }

    pub fn preferred_relays(&self) -> Option<&PreferredRelays> {
        self.preferred.as_ref()
    }

    pub fn has_preferred_relays(&self) -> bool {
        self.preferred.is_some()
    }

    pub fn cached_lists(&self) -> usize {
        self.lists.len()
    }

    pub fn set_max_preferred_relays(&mut self, max: usize) {
        self.max_preferred_relays = max;
    }

    fn is_excluded(&self, url: &CanonicalRelayUrl) -> bool {
        self.deny_list.contains(url) || self.penalty_box.contains(url)
    }

    fn rebuild(&mut self) {
        let mut preferred = PreferredRelays::default();
        for list in self.lists.values() {
            for entry in &list.relays {
                if self.is_excluded(&entry.url) {
                    continue;
                }
                if entry.marker.writes() {
                    preferred
                        .find_events_relays
                        .entry(entry.url.clone())
                        .or_default()
                        .insert(list.author);
                }
                if entry.marker.reads() {
                    preferred
                        .reach_user_relays
                        .entry(entry.url.clone())
                        .or_default()
                        .insert(list.author);
                }
            }
        }

        tracing::debug!(
            "Rebuilt preferred relays from {} lists: {} find relays, {} reach relays, {} penalized",
            self.lists.len(),
            preferred.find_events_relays.len(),
            preferred.reach_user_relays.len(),
            self.penalty_box.len()
        );
        metrics::gauge!("pool_preferred_relays", "direction" => "find")
            .set(preferred.find_events_relays.len() as f64);
        metrics::gauge!("pool_preferred_relays", "direction" => "reach")
            .set(preferred.reach_user_relays.len() as f64);
        metrics::gauge!("pool_penalty_box_size").set(self.penalty_box.len() as f64);

        self.preferred = Some(preferred);
    }

    /// Plan where to look for events by `pubkeys`.
    ///
    /// 1. Only author-scoped filters take part; their hashtag clause is removed.
    /// 2. Relays are ranked by how many authors declare them; the top
    ///    `skip_top_relays` are skipped, as are `our_read_relays`.
    /// 3. Remaining relays, most requested authors first, each take the
    ///    requested authors not yet assigned to an earlier relay.
    /// 4. Empty groups are dropped, the rest sorted by size and capped.
    pub fn plan_for_find(
        &self,
        pubkeys: &HashSet<PublicKey>,
        filters: &[Filter],
        our_read_relays: &HashSet<CanonicalRelayUrl>,
        skip_top_relays: usize,
    ) -> FindPlan {
        let Some(preferred) = &self.preferred else {
            return FindPlan::default();
        };

        let filters: Vec<Filter> = filters
            .iter()
            .filter(|f| f.authors.as_ref().is_some_and(|a| !a.is_empty()))
            .map(strip_hashtags)
            .collect();
        if filters.is_empty() || pubkeys.is_empty() {
            return FindPlan::default();
        }

        let mut ranked: Vec<(&CanonicalRelayUrl, &HashSet<PublicKey>)> =
            preferred.find_events_relays.iter().collect();
        ranked.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(b.0)));

        let mut candidates: Vec<(&CanonicalRelayUrl, Vec<PublicKey>)> = ranked
            .into_iter()
            .skip(skip_top_relays)
            .filter(|(url, _)| !our_read_relays.contains(*url))
            .map(|(url, authors)| {
                let covered: Vec<PublicKey> =
                    authors.iter().filter(|pk| pubkeys.contains(*pk)).copied().collect();
                (url, covered)
            })
            .filter(|(_, covered)| !covered.is_empty())
            .collect();
        candidates.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(b.0)));

        let mut assigned: HashSet<PublicKey> = HashSet::new();
        let mut groups: Vec<FindGroup> = Vec::new();
        for (url, covered) in candidates {
            let unique: BTreeSet<PublicKey> =
                covered.into_iter().filter(|pk| assigned.insert(*pk)).collect();
            if unique.is_empty() {
                continue;
            }
            let narrowed = filters
                .iter()
                .cloned()
                .map(|mut f| {
                    f.authors = Some(unique.clone());
                    f
                })
                .collect();
            groups.push(FindGroup {
                relay: url.clone(),
                pubkeys: unique,
                filters: narrowed,
            });
        }

        groups.sort_by_key(|g| (Reverse(g.pubkeys.len()), g.relay.clone()));
        groups.truncate(self.max_preferred_relays);

        metrics::gauge!("pool_outbox_plan_relays", "plan" => "find").set(groups.len() as f64);
        FindPlan { groups }
    }

    /// Plan where to deliver an event so that `pubkeys` see it.
    ///
    /// Every read relay of every target not in `our_write_relays` is a
    /// candidate; a pubkey may appear in several groups.
    pub fn plan_for_reach(
        &self,
        pubkeys: &HashSet<PublicKey>,
        our_write_relays: &HashSet<CanonicalRelayUrl>,
    ) -> ReachPlan {
        let Some(preferred) = &self.preferred else {
            return ReachPlan::default();
        };

        let mut groups: Vec<ReachGroup> = preferred
            .reach_user_relays
            .iter()
            .filter(|(url, _)| !our_write_relays.contains(*url))
            .map(|(url, readers)| ReachGroup {
                relay: url.clone(),
                pubkeys: readers.iter().filter(|pk| pubkeys.contains(*pk)).copied().collect(),
            })
            .filter(|g| !g.pubkeys.is_empty())
            .collect();

        groups.sort_by_key(|g| (Reverse(g.pubkeys.len()), g.relay.clone()));
        groups.truncate(self.max_preferred_relays);

        metrics::gauge!("pool_outbox_plan_relays", "plan" => "reach").set(groups.len() as f64);
        ReachPlan { groups }
    }
}

/// Copy of `filter` without its `#t` clause.
pub fn strip_hashtags(filter: &Filter) -> Filter {
    let mut filter = filter.clone();
    filter
        .generic_tags
        .remove(&SingleLetterTag::lowercase(Alphabet::T));
    filter
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventBuilder, Keys, Kind, Tag, Timestamp};

    fn url(s: &str) -> CanonicalRelayUrl {
        CanonicalRelayUrl::parse(s).unwrap()
    }

    fn relay_list(keys: &Keys, relays: &[(&str, Option<&str>)]) -> Event {
        let tags = relays.iter().map(|(u, marker)| match marker {
            Some(m) => Tag::parse(["r", *u, *m]).unwrap(),
            None => Tag::parse(["r", *u]).unwrap(),
        });
        EventBuilder::new(Kind::RelayList, "")
            .tags(tags)
            .custom_created_at(Timestamp::from(1_700_000_000))
            .sign_with_keys(keys)
            .unwrap()
    }

    fn router(deny: &[&str], max: usize) -> OutboxRouter {
        OutboxRouter::new(
            RelayListSanitizer::default(),
            deny.iter().map(|u| url(u)).collect(),
            max,
        )
    }

    fn authors_filter(pubkeys: &[PublicKey]) -> Filter {
        Filter::new().authors(pubkeys.iter().copied()).kind(Kind::TextNote)
    }

    fn set(urls: &[&str]) -> HashSet<CanonicalRelayUrl> {
        urls.iter().map(|u| url(u)).collect()
    }

    // =========================================================================
    // Map construction
    // =========================================================================

    #[test]
    fn test_no_map_until_set() {
        let r = router(&[], 50);
        let pk = Keys::generate().public_key();
        assert!(!r.has_preferred_relays());
        assert!(
            r.plan_for_find(&HashSet::from([pk]), &[authors_filter(&[pk])], &HashSet::new(), 0)
                .is_empty()
        );
    }

    #[test]
    fn test_map_splits_read_and_write() {
        let alice = Keys::generate();
        let mut r = router(&[], 50);
        r.set_preferred_relays([&relay_list(
            &alice,
            &[
                ("wss://w.example.com", Some("write")),
                ("wss://r.example.com", Some("read")),
                ("wss://b.example.com", None),
            ],
        )]);

        let map = r.preferred_relays().unwrap();
        assert!(map.find_events_relays.contains_key(&url("wss://w.example.com")));
        assert!(map.find_events_relays.contains_key(&url("wss://b.example.com")));
        assert!(!map.find_events_relays.contains_key(&url("wss://r.example.com")));
        assert!(map.reach_user_relays.contains_key(&url("wss://r.example.com")));
        assert!(map.reach_user_relays.contains_key(&url("wss://b.example.com")));
    }

    #[test]
    fn test_malformed_list_is_not_partially_applied() {
        let alice = Keys::generate();
        let mut r = router(&[], 50);
        r.set_preferred_relays([&relay_list(
            &alice,
            &[("wss://good.example.com", None), ("ws://localhost:7777", None)],
        )]);
        assert!(r.preferred_relays().unwrap().find_events_relays.is_empty());
        assert_eq!(r.cached_lists(), 0);
    }

    // =========================================================================
    // Find plans
    // =========================================================================

    #[test]
    fn test_find_excludes_our_read_relays() {
        let p = Keys::generate();
        let mut r = router(&[], 50);
        r.set_preferred_relays([&relay_list(
            &p,
            &[("wss://x.example.com", Some("write")), ("wss://y.example.com", Some("write"))],
        )]);

        let plan = r.plan_for_find(
            &HashSet::from([p.public_key()]),
            &[authors_filter(&[p.public_key()])],
            &set(&["wss://x.example.com"]),
            0,
        );

        assert_eq!(plan.groups.len(), 1);
        assert_eq!(plan.groups[0].relay, url("wss://y.example.com"));
        assert_eq!(plan.groups[0].pubkeys, BTreeSet::from([p.public_key()]));
    }

    #[test]
    fn test_find_cap_keeps_best_covered_relay() {
        // Relay A covers ten requested authors, relay B covers three
        let authors: Vec<Keys> = (0..10).map(|_| Keys::generate()).collect();
        let mut events = Vec::new();
        for (i, keys) in authors.iter().enumerate() {
            let mut relays = vec![("wss://a.example.com", Some("write"))];
            if i < 3 {
                relays.push(("wss://b.example.com", Some("write")));
            }
            events.push(relay_list(keys, &relays));
        }
        let mut r = router(&[], 1);
        r.set_preferred_relays(events.iter());

        let pubkeys: HashSet<PublicKey> = authors.iter().map(|k| k.public_key()).collect();
        let all: Vec<PublicKey> = pubkeys.iter().copied().collect();
        let plan = r.plan_for_find(&pubkeys, &[authors_filter(&all)], &HashSet::new(), 0);

        assert_eq!(plan.groups.len(), 1);
        assert_eq!(plan.groups[0].relay, url("wss://a.example.com"));
        assert_eq!(plan.groups[0].pubkeys.len(), 10);
    }

    #[test]
    fn test_find_never_uses_denied_or_penalized_relays() {
        let p = Keys::generate();
        let mut r = router(&["wss://relay.damus.io"], 50);
        r.set_preferred_relays([&relay_list(
            &p,
            &[
                ("wss://relay.damus.io", Some("write")),
                ("wss://flaky.example.com", Some("write")),
                ("wss://fine.example.com", Some("write")),
            ],
        )]);
        r.penalize(url("wss://flaky.example.com"));

        let plan = r.plan_for_find(
            &HashSet::from([p.public_key()]),
            &[authors_filter(&[p.public_key()])],
            &HashSet::new(),
            0,
        );
        let relays: Vec<_> = plan.relays().cloned().collect();
        assert_eq!(relays, vec![url("wss://fine.example.com")]);
    }

    #[test]
    fn test_penalty_change_alters_plan_without_new_events() {
        let p = Keys::generate();
        let mut r = router(&[], 50);
        r.set_preferred_relays([&relay_list(&p, &[("wss://only.example.com", Some("write"))])]);
        let pubkeys = HashSet::from([p.public_key()]);
        let filters = [authors_filter(&[p.public_key()])];

        let before = r.plan_for_find(&pubkeys, &filters, &HashSet::new(), 0);
        assert_eq!(before.groups.len(), 1);

        assert!(r.penalize(url("wss://only.example.com")));
        assert!(r.plan_for_find(&pubkeys, &filters, &HashSet::new(), 0).is_empty());

        assert!(r.release(&url("wss://only.example.com")));
        assert_eq!(r.plan_for_find(&pubkeys, &filters, &HashSet::new(), 0), before);
    }

    #[test]
    fn test_find_skips_top_relays() {
        // Everybody writes to "default", two authors also to "niche"
        let authors: Vec<Keys> = (0..4).map(|_| Keys::generate()).collect();
        let events: Vec<Event> = authors
            .iter()
            .enumerate()
            .map(|(i, k)| {
                if i < 2 {
                    relay_list(
                        k,
                        &[("wss://default.example.com", Some("write")), ("wss://niche.example.com", Some("write"))],
                    )
                } else {
                    relay_list(k, &[("wss://default.example.com", Some("write"))])
                }
            })
            .collect();
        let mut r = router(&[], 50);
        r.set_preferred_relays(events.iter());

        let pubkeys: HashSet<PublicKey> = authors.iter().map(|k| k.public_key()).collect();
        let all: Vec<PublicKey> = pubkeys.iter().copied().collect();
        let plan = r.plan_for_find(&pubkeys, &[authors_filter(&all)], &HashSet::new(), 1);

        let relays: Vec<_> = plan.relays().cloned().collect();
        assert_eq!(relays, vec![url("wss://niche.example.com")]);
        assert_eq!(plan.groups[0].pubkeys.len(), 2);
    }

    #[test]
    fn test_find_assigns_each_author_once_and_narrows_filters() {
        let a = Keys::generate();
        let b = Keys::generate();
        let mut r = router(&[], 50);
        r.set_preferred_relays([
            &relay_list(&a, &[("wss://one.example.com", Some("write")), ("wss://two.example.com", Some("write"))]),
            &relay_list(&b, &[("wss://one.example.com", Some("write"))]),
        ]);

        let pubkeys = HashSet::from([a.public_key(), b.public_key()]);
        let filter = authors_filter(&[a.public_key(), b.public_key()]).hashtag("nostr");
        let plan = r.plan_for_find(&pubkeys, &[filter], &HashSet::new(), 0);

        assert_eq!(plan.groups.len(), 1);
        let group = &plan.groups[0];
        assert_eq!(group.relay, url("wss://one.example.com"));
        assert_eq!(group.filters.len(), 1);
        assert_eq!(group.filters[0].authors.as_ref(), Some(&group.pubkeys));
        assert!(group.filters[0].generic_tags.is_empty());
    }

    #[test]
    fn test_find_ignores_hashtag_only_filters() {
        let p = Keys::generate();
        let mut r = router(&[], 50);
        r.set_preferred_relays([&relay_list(&p, &[("wss://x.example.com", Some("write"))])]);

        let plan = r.plan_for_find(
            &HashSet::from([p.public_key()]),
            &[Filter::new().hashtag("nostr")],
            &HashSet::new(),
            0,
        );
        assert!(plan.is_empty());
    }

    // =========================================================================
    // Reach plans
    // =========================================================================

    #[test]
    fn test_reach_groups_by_read_relays() {
        let a = Keys::generate();
        let b = Keys::generate();
        let mut r = router(&["wss://nos.lol"], 50);
        r.set_preferred_relays([
            &relay_list(
                &a,
                &[("wss://inbox.example.com", Some("read")), ("wss://nos.lol", Some("read"))],
            ),
            &relay_list(
                &b,
                &[("wss://inbox.example.com", Some("read")), ("wss://mine.example.com", None)],
            ),
        ]);

        let targets = HashSet::from([a.public_key(), b.public_key()]);
        let plan = r.plan_for_reach(&targets, &set(&["wss://mine.example.com"]));

        assert_eq!(plan.groups.len(), 1);
        assert_eq!(plan.groups[0].relay, url("wss://inbox.example.com"));
        assert_eq!(plan.groups[0].pubkeys.len(), 2);
    }

    #[test]
    fn test_reach_is_bounded_and_non_empty() {
        let targets: Vec<Keys> = (0..6).map(|_| Keys::generate()).collect();
        let events: Vec<Event> = targets
            .iter()
            .enumerate()
            .map(|(i, k)| {
                let inbox = format!("wss://inbox{i}.example.com");
                relay_list(k, &[(inbox.as_str(), Some("read"))])
            })
            .collect();
        let stranger = Keys::generate();
        let mut all = events.clone();
        all.push(relay_list(&stranger, &[("wss://stranger.example.com", Some("read"))]));

        let mut r = router(&[], 4);
        r.set_preferred_relays(all.iter());

        let pubkeys: HashSet<PublicKey> = targets.iter().map(|k| k.public_key()).collect();
        let plan = r.plan_for_reach(&pubkeys, &HashSet::new());
        assert_eq!(plan.groups.len(), 4);
        assert!(plan.groups.iter().all(|g| !g.pubkeys.is_empty()));
        assert!(!plan.relays().any(|u| u == &url("wss://stranger.example.com")));
    }
}
