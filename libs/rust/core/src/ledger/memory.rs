//! In-process ledger used by tests and single-host demos.
//!
//! Faults are injected through [`FaultPlan`] so callers can reproduce the
//! eventually-consistent behaviour of a real ledger: inserts that report
//! failure but land anyway, inserts that are refused outright, and reads
//! that fail transiently.
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{InsertOutcome, Ledger, Policy, PolicyRecord, Query};
use crate::error::LedgerError;

#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Inserts stored but answered with a failure status.
    pub phantom_insert_failures: usize,
    /// Inserts answered with a failure status and not stored.
    pub rejected_inserts: usize,
    /// Reads (`get` / `count`) that fail with a transport error.
    pub failed_reads: usize,
}

#[derive(Default)]
struct State {
    records: Vec<PolicyRecord>,
    faults: FaultPlan,
}

#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<State>,
    insert_calls: AtomicUsize,
}

impl InMemoryLedger {
    pub fn new() -> Self { Self::default() }

    pub fn with_faults(faults: FaultPlan) -> Self {
        let ledger = Self::default();
        ledger.state.lock().faults = faults;
        ledger
    }

    pub fn inject(&self, faults: FaultPlan) {
        self.state.lock().faults = faults;
    }

    pub fn insert_calls(&self) -> usize { self.insert_calls.load(Ordering::SeqCst) }

    /// Snapshot of everything stored, in insertion order.
    pub fn records(&self) -> Vec<PolicyRecord> { self.state.lock().records.clone() }

    pub fn records_with_key(&self, key: &str) -> Vec<PolicyRecord> {
        self.state.lock().records.iter().filter(|r| r.key == key).cloned().collect()
    }
}

fn take(counter: &mut usize) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn insert(&self, policy: &Policy) -> Result<InsertOutcome, LedgerError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if take(&mut state.faults.rejected_inserts) {
            return Ok(InsertOutcome::Rejected { status: 503, message: "ledger busy".into() });
        }
        let id = policy.content_id();
        if state.records.iter().any(|r| r.id.as_deref() == Some(id.as_str())) {
            return Ok(InsertOutcome::Duplicate);
        }
        state.records.push(PolicyRecord { key: policy.key.clone(), id: Some(id), attributes: policy.attributes.clone() });
        if take(&mut state.faults.phantom_insert_failures) {
            return Ok(InsertOutcome::Rejected { status: 500, message: "commit acknowledgement lost".into() });
        }
        Ok(InsertOutcome::Committed)
    }

    async fn delete(&self, id: &str) -> Result<(), LedgerError> {
        let mut state = self.state.lock();
        let before = state.records.len();
        state.records.retain(|r| r.id.as_deref() != Some(id));
        if state.records.len() == before {
            return Err(LedgerError::Status { status: 404, body: format!("policy {id} not found") });
        }
        Ok(())
    }

    async fn get(&self, query: &Query) -> Result<Vec<PolicyRecord>, LedgerError> {
        let mut state = self.state.lock();
        if take(&mut state.faults.failed_reads) {
            return Err(LedgerError::Transport("connection reset".into()));
        }
        Ok(state.records.iter().filter(|r| query.matches(r)).cloned().collect())
    }
}
