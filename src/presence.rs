//! Presence tracking for notification delivery.
//!
//! The service watches available/unavailable presences of subscribers so
//! that presence-gated nodes and subscriptions with show-value filters
//! only deliver to users who are actually online in an acceptable state.
//! Offline users have no entry at all.

use std::collections::HashMap;

use dashmap::DashMap;
use jid::{BareJid, FullJid, Jid};
use xmpp_parsers::presence::Show;

/// Show value recorded when an available presence carries no `<show/>`.
pub const SHOW_ONLINE: &str = "online";

/// Map the optional `<show/>` of an available presence to its recorded value.
pub fn show_value(show: Option<Show>) -> &'static str {
    match show {
        None => SHOW_ONLINE,
        Some(Show::Away) => "away",
        Some(Show::Chat) => "chat",
        Some(Show::Dnd) => "dnd",
        Some(Show::Xa) => "xa",
    }
}

/// Last known presence show value per connected resource, keyed by bare JID.
///
/// Updates and reads race freely between the dispatch workers and the
/// notification path; the sharded map makes the per-bare-JID upsert
/// atomic, so two resources of the same user coming online concurrently
/// never lose each other's entry.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    resources: DashMap<BareJid, HashMap<FullJid, String>>,
}

impl PresenceTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
        }
    }

    /// Record an available presence from `from`.
    pub fn available(&self, from: &FullJid, show: Option<Show>) {
        let mut entry = self.resources.entry(from.to_bare()).or_default();
        entry.insert(from.clone(), show_value(show).to_string());
    }

    /// Remove the resource after an unavailable presence, pruning the
    /// bare JID entry when its last resource goes away.
    pub fn unavailable(&self, from: &FullJid) {
        let bare = from.to_bare();
        let mut remove_outer = false;
        if let Some(mut entry) = self.resources.get_mut(&bare) {
            entry.remove(from);
            remove_outer = entry.is_empty();
        }
        if remove_outer {
            self.resources.remove_if(&bare, |_, resources| resources.is_empty());
        }
    }

    /// Show values of the last known presences for `jid`.
    ///
    /// A bare JID answers one value per connected resource; a full JID
    /// answers at most one. Offline users answer an empty list.
    pub fn shows_for(&self, jid: &Jid) -> Vec<String> {
        match jid.clone().try_into_full() {
            Ok(full) => self
                .resources
                .get(&full.to_bare())
                .and_then(|entry| entry.get(&full).cloned())
                .into_iter()
                .collect(),
            Err(bare) => self
                .resources
                .get(&bare)
                .map(|entry| entry.values().cloned().collect())
                .unwrap_or_default(),
        }
    }

    /// Whether any resource of `bare` is online.
    pub fn is_online(&self, bare: &BareJid) -> bool {
        self.resources.get(bare).map(|e| !e.is_empty()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full(s: &str) -> FullJid {
        s.parse().expect("valid full jid")
    }

    fn jid(s: &str) -> Jid {
        s.parse().expect("valid jid")
    }

    #[test]
    fn test_available_records_online_without_show() {
        let tracker = PresenceTracker::new();
        tracker.available(&full("bob@example.com/r1"), None);

        assert_eq!(tracker.shows_for(&jid("bob@example.com")), vec!["online"]);
    }

    #[test]
    fn test_bare_lookup_collects_all_resources() {
        let tracker = PresenceTracker::new();
        tracker.available(&full("bob@example.com/r1"), Some(Show::Away));
        tracker.available(&full("bob@example.com/r2"), Some(Show::Dnd));

        let mut shows = tracker.shows_for(&jid("bob@example.com"));
        shows.sort();
        assert_eq!(shows, vec!["away", "dnd"]);
    }

    #[test]
    fn test_full_lookup_answers_single_resource() {
        let tracker = PresenceTracker::new();
        tracker.available(&full("bob@example.com/r1"), Some(Show::Away));
        tracker.available(&full("bob@example.com/r2"), None);

        assert_eq!(tracker.shows_for(&jid("bob@example.com/r1")), vec!["away"]);
        assert_eq!(
            tracker.shows_for(&jid("bob@example.com/r3")),
            Vec::<String>::new()
        );
    }

    #[test]
    fn test_unavailable_prunes_empty_entry() {
        let tracker = PresenceTracker::new();
        tracker.available(&full("bob@example.com/r1"), None);
        tracker.unavailable(&full("bob@example.com/r1"));

        assert!(!tracker.is_online(&"bob@example.com".parse().expect("valid jid")));
        assert!(tracker.shows_for(&jid("bob@example.com")).is_empty());
    }

    #[test]
    fn test_unavailable_keeps_remaining_resources() {
        let tracker = PresenceTracker::new();
        tracker.available(&full("bob@example.com/r1"), None);
        tracker.available(&full("bob@example.com/r2"), Some(Show::Chat));
        tracker.unavailable(&full("bob@example.com/r1"));

        assert_eq!(tracker.shows_for(&jid("bob@example.com")), vec!["chat"]);
    }

    #[test]
    fn test_presence_update_replaces_show() {
        let tracker = PresenceTracker::new();
        tracker.available(&full("bob@example.com/r1"), None);
        tracker.available(&full("bob@example.com/r1"), Some(Show::Xa));

        assert_eq!(tracker.shows_for(&jid("bob@example.com/r1")), vec!["xa"]);
    }
}
