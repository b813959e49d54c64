//! Aggregator-process coordination state, behind one mutex.
//!
//! Registration tasks, control calls and coordinator loops all mutate the
//! roster, the name-slot counter and the per-index participant threshold;
//! none of them ever sees the map itself.
use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use serde::Serialize;

use ledgerfl_resilience::Quorum;

use super::records::IndexRecord;
use super::roster::Roster;
use crate::error::FlError;
use crate::lifecycle::{InvalidTransition, RoundPhase, RoundTracker};

#[derive(Debug)]
struct IndexState {
    record: IndexRecord,
    roster: Roster,
    /// Urls with a reserved slot whose registration is still running.
    pending: HashSet<String>,
    min_participants: usize,
    tracker: RoundTracker,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexStatus {
    pub index: String,
    pub module_name: String,
    pub dataset_handle: String,
    pub phase: RoundPhase,
    pub round: u64,
    pub nodes: Vec<NodeInfo>,
    pub node_count: usize,
    pub min_participants: usize,
    pub effective_min_participants: usize,
    pub training_active: bool,
}

#[derive(Debug, Default)]
pub struct CoordinatorState {
    indices: Mutex<HashMap<String, IndexState>>,
}

impl CoordinatorState {
    pub fn new() -> Self { Self::default() }

    pub fn is_known(&self, index: &str) -> bool { self.indices.lock().contains_key(index) }

    pub fn indices(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indices.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Adds an index; returns `false` when it was already tracked.
    pub fn track(&self, record: IndexRecord, roster: Roster) -> bool {
        let mut map = self.indices.lock();
        if map.contains_key(&record.name) {
            return false;
        }
        let name = record.name.clone();
        map.insert(name, IndexState { record, roster, pending: HashSet::new(), min_participants: 1, tracker: RoundTracker::new() });
        true
    }

    pub fn record(&self, index: &str) -> Result<IndexRecord, FlError> {
        self.with(index, |s| s.record.clone())
    }

    fn with<T>(&self, index: &str, f: impl FnOnce(&mut IndexState) -> T) -> Result<T, FlError> {
        let mut map = self.indices.lock();
        let state = map.get_mut(index).ok_or_else(|| FlError::UnknownIndex(index.to_string()))?;
        Ok(f(state))
    }

    /// Reserves a name slot for `url`; `None` when the url is already
    /// registered or being registered.
    pub fn reserve_slot(&self, index: &str, url: &str) -> Result<Option<usize>, FlError> {
        self.with(index, |s| {
            if s.roster.contains(url) || !s.pending.insert(url.to_string()) {
                return None;
            }
            Some(s.roster.reserve())
        })
    }

    pub fn commit_slot(&self, index: &str, url: &str, slot: usize) -> Result<String, FlError> {
        self.with(index, |s| {
            s.pending.remove(url);
            s.roster.commit(url, slot)
        })
    }

    pub fn release_slot(&self, index: &str, url: &str, slot: usize) {
        let _ = self.with(index, |s| {
            s.pending.remove(url);
            s.roster.release(slot);
        });
    }

    /// Ends a registration whose outcome is unknown. The url may register
    /// again, but the slot's name is never handed out twice.
    pub fn retire_slot(&self, index: &str, url: &str, slot: usize) {
        let _ = self.with(index, |s| {
            s.pending.remove(url);
            s.roster.retire(slot);
        });
    }

    pub fn set_min_participants(&self, index: &str, requested: usize) -> Result<Quorum, FlError> {
        self.with(index, |s| {
            s.min_participants = requested;
            Quorum::clamp(requested, s.roster.size())
        })
    }

    /// Threshold for the next quorum check, clamped to the live roster.
    pub fn quorum(&self, index: &str) -> Result<Quorum, FlError> {
        self.with(index, |s| Quorum::clamp(s.min_participants, s.roster.size()))
    }

    pub fn current_round(&self, index: &str) -> Result<u64, FlError> {
        self.with(index, |s| s.tracker.round())
    }

    pub fn transition(&self, index: &str, f: impl FnOnce(&mut RoundTracker) -> Result<(), InvalidTransition>) -> Result<(), FlError> {
        self.with(index, |s| f(&mut s.tracker))?
            .map_err(|t| FlError::InvalidRequest(format!("round state of {index} cannot move from {:?} to {:?}", t.from, t.to)))
    }

    pub fn status(&self, index: &str, training_active: bool) -> Result<IndexStatus, FlError> {
        self.with(index, |s| IndexStatus {
            index: index.to_string(),
            module_name: s.record.module_name.clone(),
            dataset_handle: s.record.dataset_handle.clone(),
            phase: s.tracker.phase(),
            round: s.tracker.round(),
            nodes: s.roster.members().map(|(url, name)| NodeInfo { name: name.to_string(), url: url.to_string() }).collect(),
            node_count: s.roster.node_count(),
            min_participants: s.min_participants,
            effective_min_participants: Quorum::clamp(s.min_participants, s.roster.size()).effective,
            training_active,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo() -> IndexRecord {
        IndexRecord { name: "demo".into(), module_name: "linear-sgd".into(), module_path: "builtin".into(), dataset_handle: "synthetic".into() }
    }

    #[test]
    fn quorum_follows_roster_and_updates() {
        let st = CoordinatorState::new();
        assert!(st.track(demo(), Roster::new()));
        assert!(!st.track(demo(), Roster::new()));
        for url in ["http://a:1", "http://b:1", "http://c:1"] {
            let slot = st.reserve_slot("demo", url).unwrap().unwrap();
            st.commit_slot("demo", url, slot).unwrap();
        }
        assert_eq!(st.reserve_slot("demo", "http://a:1").unwrap(), None);
        let q = st.set_min_participants("demo", 100).unwrap();
        assert_eq!(q.effective, 3);
        st.set_min_participants("demo", 2).unwrap();
        assert_eq!(st.quorum("demo").unwrap().effective, 2);
        assert!(matches!(st.quorum("other"), Err(FlError::UnknownIndex(_))));
    }

    #[test]
    fn status_reports_roster() {
        let st = CoordinatorState::new();
        st.track(demo(), Roster::new());
        let slot = st.reserve_slot("demo", "http://a:1").unwrap().unwrap();
        st.commit_slot("demo", "http://a:1", slot).unwrap();
        st.transition("demo", |t| t.round_started(1)).unwrap();
        let status = st.status("demo", true).unwrap();
        assert_eq!(status.nodes, vec![NodeInfo { name: "node1".into(), url: "http://a:1".into() }]);
        assert_eq!(status.phase, RoundPhase::RoundStarted);
        assert_eq!(status.round, 1);
        assert!(st.transition("demo", |t| t.aggregating()).is_err());
    }

    #[test]
    fn in_flight_url_cannot_be_reserved_twice() {
        let st = CoordinatorState::new();
        st.track(demo(), Roster::new());
        let slot = st.reserve_slot("demo", "http://a:1").unwrap().unwrap();
        assert_eq!(st.reserve_slot("demo", "http://a:1").unwrap(), None);
        st.release_slot("demo", "http://a:1", slot);
        assert_eq!(st.reserve_slot("demo", "http://a:1").unwrap(), Some(slot));
    }

    #[test]
    fn retired_slot_frees_the_url_but_not_the_name() {
        let st = CoordinatorState::new();
        st.track(demo(), Roster::new());
        let slot = st.reserve_slot("demo", "http://a:1").unwrap().unwrap();
        st.retire_slot("demo", "http://a:1", slot);
        assert_eq!(st.reserve_slot("demo", "http://a:1").unwrap(), Some(slot + 1));
        assert!(st.status("demo", false).unwrap().nodes.is_empty());
    }
}
