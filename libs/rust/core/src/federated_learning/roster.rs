use std::collections::{BTreeMap, BTreeSet};

use super::records::RosterEntry;

/// Nodes registered for one index plus the name-slot counter.
///
/// A slot is reserved before the node is contacted and either committed
/// (node joins the roster), released (the node refused) or retired (the
/// node may have acted on the request). Released slots are handed out again
/// lowest first; retired ones never are.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    nodes: BTreeMap<String, String>,
    node_count: usize,
    released: BTreeSet<usize>,
}

pub fn node_name(slot: usize) -> String { format!("node{slot}") }

fn slot_of(name: &str) -> Option<usize> { name.strip_prefix("node")?.parse().ok() }

impl Roster {
    pub fn new() -> Self { Self::default() }

    pub fn contains(&self, url: &str) -> bool { self.nodes.contains_key(url) }
    pub fn size(&self) -> usize { self.nodes.len() }
    pub fn node_count(&self) -> usize { self.node_count }

    /// `(url, name)` pairs ordered by url.
    pub fn members(&self) -> impl Iterator<Item = (&str, &str)> {
        self.nodes.iter().map(|(u, n)| (u.as_str(), n.as_str()))
    }

    pub fn reserve(&mut self) -> usize {
        if let Some(slot) = self.released.pop_first() {
            return slot;
        }
        self.node_count += 1;
        self.node_count
    }

    pub fn commit(&mut self, url: &str, slot: usize) -> String {
        let name = node_name(slot);
        self.nodes.insert(url.to_string(), name.clone());
        name
    }

    pub fn release(&mut self, slot: usize) {
        if slot == self.node_count {
            self.node_count -= 1;
            while self.node_count > 0 && self.released.remove(&self.node_count) {
                self.node_count -= 1;
            }
        } else if slot > 0 && slot < self.node_count {
            self.released.insert(slot);
        }
    }

    /// Keeps `slot` consumed without a member; its name is never reissued.
    pub fn retire(&mut self, slot: usize) {
        self.released.remove(&slot);
    }

    /// Rebuilds a roster from persisted entries; gaps become released slots.
    pub fn rehydrate<'a>(entries: impl IntoIterator<Item = &'a RosterEntry>) -> Self {
        let mut roster = Self::new();
        for e in entries {
            if let Some(slot) = slot_of(&e.node_name) {
                roster.node_count = roster.node_count.max(slot);
            }
            roster.nodes.insert(e.node_url.clone(), e.node_name.clone());
        }
        let used: BTreeSet<usize> = roster.nodes.values().filter_map(|n| slot_of(n)).collect();
        roster.released = (1..=roster.node_count).filter(|s| !used.contains(s)).collect();
        roster
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_reuses_slot() {
        let mut r = Roster::new();
        let a = r.reserve();
        r.commit("http://a:8080", a);
        let b = r.reserve();
        r.release(b);
        assert_eq!(r.node_count(), 1);
        let again = r.reserve();
        assert_eq!(again, b);
        assert_eq!(r.commit("http://b:8080", again), "node2");
        assert_eq!(r.size(), 2);
    }

    #[test]
    fn concurrent_failures_leave_no_duplicates() {
        let mut r = Roster::new();
        let s1 = r.reserve();
        let s2 = r.reserve();
        let s3 = r.reserve();
        r.release(s1);
        r.commit("http://c:8080", s3);
        r.release(s2);
        assert_eq!(r.node_count(), 3);
        assert_eq!(r.reserve(), 1);
        assert_eq!(r.reserve(), 2);
        assert_eq!(r.reserve(), 4);
    }

    #[test]
    fn releasing_the_top_slot_collapses_trailing_gaps() {
        let mut r = Roster::new();
        let s1 = r.reserve();
        let s2 = r.reserve();
        r.release(s1);
        r.release(s2);
        assert_eq!(r.node_count(), 0);
        assert_eq!(r.reserve(), 1);
    }

    #[test]
    fn retired_slot_is_never_reissued() {
        let mut r = Roster::new();
        let s1 = r.reserve();
        let s2 = r.reserve();
        r.retire(s1);
        r.release(s2);
        assert_eq!(r.node_count(), 1);
        assert_eq!(r.reserve(), 2);
        assert_eq!(r.reserve(), 3);
    }

    #[test]
    fn rehydrates_from_entries() {
        let entries = vec![
            RosterEntry { index: "demo".into(), node_name: "node1".into(), node_url: "http://a:8080".into() },
            RosterEntry { index: "demo".into(), node_name: "node3".into(), node_url: "http://c:8080".into() },
        ];
        let mut r = Roster::rehydrate(&entries);
        assert_eq!(r.size(), 2);
        assert_eq!(r.node_count(), 3);
        assert!(r.contains("http://c:8080"));
        assert_eq!(r.reserve(), 2);
        assert_eq!(r.reserve(), 4);
    }
}
