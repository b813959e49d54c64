//! Ledger records of the round protocol and the keys they live under.
use serde::{Deserialize, Serialize};

use crate::ledger::{Condition, LedgerRecord};

pub const INDEX_KEY: &str = "index";

pub fn announcement_key(index: &str, round: u64) -> String { format!("{index}-r{round}") }
pub fn node_result_key(index: &str, round: u64) -> String { format!("{index}-a{round}") }
pub fn latest_aggregate_key(index: &str) -> String { format!("{index}-r") }
pub fn roster_key(index: &str) -> String { format!("{index}-n") }

/// A named training job; at most one per `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub name: String,
    pub module_name: String,
    pub module_path: String,
    pub dataset_handle: String,
}

impl LedgerRecord for IndexRecord {
    fn key(&self) -> String { INDEX_KEY.to_string() }
    fn identity(&self) -> Vec<Condition> { vec![Condition::eq("name", &self.name)] }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundAnnouncement {
    pub index: String,
    pub round: u64,
    pub node_type: String,
    /// Remote path of the previous aggregate; empty for a fresh round 1.
    pub init_params: String,
    /// Ledger node address of the aggregator, where `init_params` is pulled from.
    pub origin_address: String,
}

impl RoundAnnouncement {
    pub fn new(index: &str, round: u64, init_params: &str, origin_address: &str) -> Self {
        Self {
            index: index.to_string(),
            round,
            node_type: "aggregator".into(),
            init_params: init_params.to_string(),
            origin_address: origin_address.to_string(),
        }
    }
}

impl LedgerRecord for RoundAnnouncement {
    fn key(&self) -> String { announcement_key(&self.index, self.round) }
}

/// One per (node, round); many share the round's key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResult {
    pub index: String,
    pub round: u64,
    pub node_id: String,
    pub node_type: String,
    pub node_address: String,
    pub artifact_path: String,
}

impl NodeResult {
    pub fn new(index: &str, round: u64, node_id: &str, node_address: &str, artifact_path: &str) -> Self {
        Self {
            index: index.to_string(),
            round,
            node_id: node_id.to_string(),
            node_type: "training".into(),
            node_address: node_address.to_string(),
            artifact_path: artifact_path.to_string(),
        }
    }
}

impl LedgerRecord for NodeResult {
    fn key(&self) -> String { node_result_key(&self.index, self.round) }
    fn identity(&self) -> Vec<Condition> { vec![Condition::eq("node_id", &self.node_id)] }
}

/// Replaceable pointer to the newest aggregate of an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestAggregate {
    pub index: String,
    pub round: u64,
    pub artifact_path: String,
    pub origin_address: String,
}

impl LedgerRecord for LatestAggregate {
    fn key(&self) -> String { latest_aggregate_key(&self.index) }
    fn identity(&self) -> Vec<Condition> { vec![Condition::eq("round", self.round)] }
}

/// A node registered for an index, persisted so a restarted aggregator can
/// rebuild its roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub index: String,
    pub node_name: String,
    pub node_url: String,
}

impl LedgerRecord for RosterEntry {
    fn key(&self) -> String { roster_key(&self.index) }
    fn identity(&self) -> Vec<Condition> { vec![Condition::eq("node_url", &self.node_url)] }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_follow_ledger_layout() {
        let ann = RoundAnnouncement::new("demo", 3, "", "10.0.0.1:32048");
        assert_eq!(ann.key(), "demo-r3");
        let res = NodeResult::new("demo", 3, "node1", "10.0.0.2:32048", "/a/demo-3-replica-node1.json");
        assert_eq!(res.key(), "demo-a3");
        assert_eq!(res.lookup().to_command(false), "blockchain get demo-a3 where [node_id] = node1");
        assert_eq!(latest_aggregate_key("demo"), "demo-r");
        assert_eq!(roster_key("demo"), "demo-n");
    }

    #[test]
    fn announcement_policy_shape() {
        let ann = RoundAnnouncement::new("demo", 1, "", "10.0.0.1:32048");
        let p = ann.to_policy().unwrap();
        assert_eq!(p.attributes.get("node_type").and_then(|v| v.as_str()), Some("aggregator"));
        assert_eq!(p.attributes.get("init_params").and_then(|v| v.as_str()), Some(""));
    }
}
