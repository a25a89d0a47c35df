//! Immutable snapshot of the identities being watched.

use std::collections::{BTreeMap, HashMap};

use crate::{codec::PublicKey, message::SubscriptionFilter};

/// A user whose mentions and direct messages are forwarded by email.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEntry {
    pub pubkey: PublicKey,
    pub npub: String,
    /// Display name; also the canonical username in the directory.
    pub name: String,
    /// Contact address notifications are sent to.
    pub email: String,
    /// Lowercased strings whose presence in note content counts as a mention.
    pub aliases: Vec<String>,
}

impl WatchEntry {
    pub fn new(pubkey: PublicKey, name: &str, email: &str) -> Self {
        Self {
            pubkey,
            npub: pubkey.to_npub(),
            name: name.to_string(),
            email: email.to_string(),
            aliases: vec![name.to_lowercase()],
        }
    }

    /// Does free text mention this entry by `npub` or alias?
    pub fn mentioned_in(&self, content: &str) -> bool {
        if content.contains(&self.npub) {
            return true;
        }
        let lower = content.to_lowercase();
        self.aliases
            .iter()
            .any(|a| !a.is_empty() && lower.contains(a.as_str()))
    }
}

/// Lookup tables built once before any relay task starts and shared
/// read-only afterwards.
#[derive(Debug, Default)]
pub struct WatchList {
    entries: Vec<WatchEntry>,
    by_npub: BTreeMap<String, usize>,
    by_pubkey: HashMap<PublicKey, usize>,
}

impl WatchList {
    /// Build the snapshot. `extra_aliases` is keyed by lowercased name. A
    /// second entry for an `npub` already present is ignored.
    pub fn new(entries: Vec<WatchEntry>, extra_aliases: &HashMap<String, Vec<String>>) -> Self {
        let mut list = WatchList::default();
        for mut entry in entries {
            if list.by_npub.contains_key(&entry.npub) {
                tracing::warn!(npub = %entry.npub, name = %entry.name, "duplicate watch entry ignored");
                continue;
            }
            if let Some(extra) = extra_aliases.get(&entry.name.to_lowercase()) {
                for alias in extra {
                    if !entry.aliases.contains(alias) {
                        entry.aliases.push(alias.clone());
                    }
                }
            }
            let idx = list.entries.len();
            list.by_npub.insert(entry.npub.clone(), idx);
            list.by_pubkey.insert(entry.pubkey, idx);
            list.entries.push(entry);
        }
        list
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[WatchEntry] {
        &self.entries
    }

    pub fn by_pubkey(&self, pk: &PublicKey) -> Option<&WatchEntry> {
        self.by_pubkey.get(pk).map(|&i| &self.entries[i])
    }

    #[cfg(test)]
    pub fn by_npub(&self, npub: &str) -> Option<&WatchEntry> {
        self.by_npub.get(npub).map(|&i| &self.entries[i])
    }

    /// Filter addressing every watched key with a `#p` tag filter.
    pub fn filter(&self, kinds: &[u32], since: u64) -> SubscriptionFilter {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.pubkey.to_hex()).collect();
        keys.sort();
        SubscriptionFilter {
            kinds: kinds.to_vec(),
            tags: BTreeMap::from([("#p".to_string(), keys)]),
            since,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(b: u8, name: &str) -> WatchEntry {
        WatchEntry::new(PublicKey::from_bytes([b; 32]), name, &format!("{name}@example"))
    }

    #[test]
    fn indexes_by_both_forms() {
        let list = WatchList::new(vec![entry(1, "alice"), entry(2, "bob")], &HashMap::new());
        let bob = PublicKey::from_bytes([2; 32]);
        assert_eq!(list.by_pubkey(&bob).unwrap().name, "bob");
        assert_eq!(list.by_npub(&bob.to_npub()).unwrap().email, "bob@example");
        assert!(list.by_pubkey(&PublicKey::from_bytes([3; 32])).is_none());
    }

    #[test]
    fn duplicate_npub_keeps_first() {
        let list = WatchList::new(vec![entry(1, "alice"), entry(1, "mallory")], &HashMap::new());
        assert_eq!(list.len(), 1);
        assert_eq!(list.entries()[0].name, "alice");
    }

    #[test]
    fn content_mentions_by_npub_and_alias() {
        let aliases = HashMap::from([("thefriendlyhost".to_string(), vec!["tfh".to_string()])]);
        let list = WatchList::new(vec![entry(1, "TheFriendlyHost")], &aliases);
        let e = &list.entries()[0];
        assert!(e.mentioned_in(&format!("ping {}", e.npub)));
        assert!(e.mentioned_in("thanks @thefriendlyhost!"));
        assert!(e.mentioned_in("TFH rocks"));
        assert!(!e.mentioned_in("nothing to see"));
    }

    #[test]
    fn filter_lists_all_keys() {
        let list = WatchList::new(vec![entry(2, "bob"), entry(1, "alice")], &HashMap::new());
        let f = list.filter(&[1, 4], 10);
        assert_eq!(f.kinds, vec![1, 4]);
        assert_eq!(f.since, 10);
        assert_eq!(f.tags["#p"], vec!["01".repeat(32), "02".repeat(32)]);
    }
}
