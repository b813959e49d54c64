//! Ledger client: the append-only policy store every party coordinates through.
//!
//! The ledger is neither transactional nor strongly consistent. An insert can
//! report failure and still become visible later, and a repeated insert of
//! the same policy is rejected as a duplicate. [`idempotent`] layers the
//! write discipline on top of the raw [`Ledger`] contract.

pub mod http;
pub mod idempotent;
pub mod memory;
mod policy;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::LedgerError;

pub use http::HttpLedger;
pub use idempotent::{idempotent_insert, replace_pointer, InsertAck};
pub use memory::{FaultPlan, InMemoryLedger};
pub use policy::{parse_count, parse_records, LedgerRecord, Policy, PolicyRecord};

/// Equality filter on one policy attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub attribute: String,
    pub value: String,
}

impl Condition {
    pub fn eq(attribute: impl Into<String>, value: impl ToString) -> Self {
        Self { attribute: attribute.into(), value: value.to_string() }
    }

    pub fn matches(&self, record: &PolicyRecord) -> bool {
        record.attribute(&self.attribute).as_deref() == Some(self.value.as_str())
    }
}

/// A `get`: an exact key (or any key) plus attribute filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub key: Option<String>,
    pub conditions: Vec<Condition>,
}

impl Query {
    pub fn key(key: impl Into<String>) -> Self { Self { key: Some(key.into()), conditions: Vec::new() } }
    pub fn any() -> Self { Self { key: None, conditions: Vec::new() } }

    pub fn and_eq(mut self, attribute: impl Into<String>, value: impl ToString) -> Self {
        self.conditions.push(Condition::eq(attribute, value));
        self
    }

    pub fn with_conditions(mut self, conditions: impl IntoIterator<Item = Condition>) -> Self {
        self.conditions.extend(conditions);
        self
    }

    pub fn matches(&self, record: &PolicyRecord) -> bool {
        self.key.as_deref().map_or(true, |k| k == record.key) && self.conditions.iter().all(|c| c.matches(record))
    }

    /// Renders the ledger command, e.g. `blockchain get demo-a3 where [node_id] = node1 count`.
    pub fn to_command(&self, count: bool) -> String {
        let mut cmd = format!("blockchain get {}", self.key.as_deref().unwrap_or("*"));
        for (i, c) in self.conditions.iter().enumerate() {
            cmd.push_str(if i == 0 { " where " } else { " and " });
            cmd.push_str(&format!("[{}] = {}", c.attribute, c.value));
        }
        if count {
            cmd.push_str(" count");
        }
        cmd
    }
}

/// Raw result of one insert attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Committed,
    /// The ledger already holds a policy with the same content id.
    Duplicate,
    /// Non-success reply; the write may or may not have landed.
    Rejected { status: u16, message: String },
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn insert(&self, policy: &Policy) -> Result<InsertOutcome, LedgerError>;
    async fn delete(&self, id: &str) -> Result<(), LedgerError>;
    /// Matching records in ledger scan order.
    async fn get(&self, query: &Query) -> Result<Vec<PolicyRecord>, LedgerError>;

    async fn count(&self, query: &Query) -> Result<usize, LedgerError> {
        Ok(self.get(query).await?.len())
    }
}

pub(crate) fn value_as_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
