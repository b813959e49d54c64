//! Write discipline for a ledger whose failures are not trustworthy.
//!
//! A failed insert may still land. Retrying blindly would either spin on
//! duplicate errors or, for records without a stable id, write twice. So
//! every failed attempt is followed by a read-back of the record's identity
//! and the loop ends as soon as the record is visible.
use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

use ledgerfl_resilience::{retry_with_jitter, CancelScope, RetryPolicy};

use super::{InsertOutcome, Ledger, LedgerRecord, Query};
use crate::error::LedgerError;
use crate::metrics_ext::FL_METRICS;

/// How an idempotent insert concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertAck {
    Committed,
    /// The ledger already held this exact policy.
    AlreadyPresent,
    /// An attempt reported failure but the record was found on read-back.
    Confirmed,
}

/// Inserts `record` until it is visible, absorbing duplicate errors and
/// failures that landed anyway. Gives up only when `scope` interrupts.
pub async fn idempotent_insert<R: LedgerRecord>(
    ledger: &dyn Ledger,
    record: &R,
    policy: &RetryPolicy,
    scope: &CancelScope,
) -> Result<InsertAck, LedgerError> {
    let doc = record.to_policy()?;
    let lookup = record.lookup();
    let mut attempt: u32 = 0;
    loop {
        scope.check()?;
        attempt += 1;
        let outcome = ledger.insert(&doc).await;
        let label = match &outcome {
            Ok(InsertOutcome::Committed) => "committed",
            Ok(InsertOutcome::Duplicate) => "duplicate",
            Ok(InsertOutcome::Rejected { .. }) => "rejected",
            Err(_) => "error",
        };
        FL_METRICS.ledger.inserts_total.add(1, &[KeyValue::new("outcome", label)]);
        match outcome {
            Ok(InsertOutcome::Committed) => {
                debug!(key = %doc.key, attempt, "policy committed");
                return Ok(InsertAck::Committed);
            }
            Ok(InsertOutcome::Duplicate) => {
                debug!(key = %doc.key, attempt, "policy already present");
                return Ok(InsertAck::AlreadyPresent);
            }
            Ok(InsertOutcome::Rejected { status, message }) => {
                warn!(key = %doc.key, attempt, status, %message, "insert rejected");
            }
            Err(LedgerError::Interrupted(i)) => return Err(i.into()),
            Err(e) => warn!(key = %doc.key, attempt, error = %e, "insert failed"),
        }
        FL_METRICS.ledger.insert_retries_total.add(1, &[]);
        scope.sleep(policy.jitter()).await?;
        match ledger.get(&lookup).await {
            Ok(found) if !found.is_empty() => {
                FL_METRICS.ledger.confirmed_by_readback_total.add(1, &[]);
                info!(key = %doc.key, attempt, "insert confirmed by read-back");
                return Ok(InsertAck::Confirmed);
            }
            Ok(_) => {}
            Err(e) => debug!(key = %doc.key, error = %e, "read-back failed"),
        }
    }
}

/// Replaces the single record stored under `record.key()`: deletes every
/// existing copy, then inserts the new one idempotently.
pub async fn replace_pointer<R: LedgerRecord>(
    ledger: &dyn Ledger,
    record: &R,
    policy: &RetryPolicy,
    scope: &CancelScope,
) -> Result<InsertAck, LedgerError> {
    let key = record.key();
    let existing = {
        let q = Query::key(key.clone());
        let q = &q;
        retry_with_jitter(policy, scope, "pointer lookup", move || ledger.get(q)).await?
    };
    for old in existing {
        let Some(id) = old.id else {
            warn!(%key, "pointer record has no id; leaving it in place");
            continue;
        };
        let id = &id;
        retry_with_jitter(policy, scope, "pointer delete", move || async move {
            match ledger.delete(id).await {
                Err(LedgerError::Status { status: 404, .. }) => Ok(()),
                other => other,
            }
        })
        .await?;
    }
    FL_METRICS.ledger.pointer_replacements_total.add(1, &[]);
    idempotent_insert(ledger, record, policy, scope).await
}
