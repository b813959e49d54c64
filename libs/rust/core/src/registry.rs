//! Index Registry: job names mapped to their training application and
//! dataset, persisted in the ledger so every party can rehydrate them.
use std::sync::Arc;

use tracing::{error, info};

use ledgerfl_resilience::{CancelScope, RetryPolicy};

use crate::error::RegistryError;
use crate::federated_learning::records::{latest_aggregate_key, roster_key, IndexRecord, LatestAggregate, RosterEntry, INDEX_KEY};
use crate::ledger::{idempotent_insert, InsertAck, Ledger, LedgerRecord, Query};

#[derive(Clone)]
pub struct IndexRegistry {
    ledger: Arc<dyn Ledger>,
    policy: RetryPolicy,
}

impl IndexRegistry {
    pub fn new(ledger: Arc<dyn Ledger>, policy: RetryPolicy) -> Self { Self { ledger, policy } }

    fn by_name(name: &str) -> Query { Query::key(INDEX_KEY).and_eq("name", name) }

    /// Creates the index record; `AlreadyRegistered` when any record claims the name.
    pub async fn register(&self, record: &IndexRecord, scope: &CancelScope) -> Result<InsertAck, RegistryError> {
        if !self.ledger.get(&Self::by_name(&record.name)).await?.is_empty() {
            return Err(RegistryError::AlreadyRegistered(record.name.clone()));
        }
        let ack = idempotent_insert(self.ledger.as_ref(), record, &self.policy, scope).await?;
        info!(index = %record.name, module = %record.module_name, ?ack, "index registered");
        Ok(ack)
    }

    pub async fn resolve(&self, name: &str) -> Result<IndexRecord, RegistryError> {
        let found = self.ledger.get(&Self::by_name(name)).await?;
        match found.as_slice() {
            [] => Err(RegistryError::NotFound(name.to_string())),
            [one] => Ok(IndexRecord::from_record(one)?),
            many => {
                error!(index = %name, count = many.len(), "conflicting index records");
                Err(RegistryError::Inconsistent { name: name.to_string(), count: many.len() })
            }
        }
    }

    pub async fn roster_entries(&self, name: &str) -> Result<Vec<RosterEntry>, RegistryError> {
        let found = self.ledger.get(&Query::key(roster_key(name))).await?;
        Ok(found.iter().map(RosterEntry::from_record).collect::<Result<_, _>>()?)
    }

    /// Newest persisted aggregate; the highest round wins if a replace left two.
    pub async fn latest_aggregate(&self, name: &str) -> Result<Option<LatestAggregate>, RegistryError> {
        let found = self.ledger.get(&Query::key(latest_aggregate_key(name))).await?;
        let mut pointers = found.iter().map(LatestAggregate::from_record).collect::<Result<Vec<_>, _>>()?;
        pointers.sort_by_key(|p| p.round);
        Ok(pointers.pop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{InMemoryLedger, Policy};
    use std::time::Duration;

    fn registry(ledger: Arc<InMemoryLedger>) -> IndexRegistry {
        IndexRegistry::new(ledger, RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(1), Duration::from_millis(2)))
    }

    fn demo(module: &str) -> IndexRecord {
        IndexRecord { name: "demo".into(), module_name: module.into(), module_path: "builtin".into(), dataset_handle: "synthetic".into() }
    }

    #[tokio::test]
    async fn register_then_resolve() {
        let ledger = Arc::new(InMemoryLedger::new());
        let reg = registry(ledger.clone());
        reg.register(&demo("linear-sgd"), &CancelScope::unbounded()).await.unwrap();
        assert!(matches!(reg.register(&demo("linear-sgd"), &CancelScope::unbounded()).await, Err(RegistryError::AlreadyRegistered(_))));
        assert_eq!(reg.resolve("demo").await.unwrap(), demo("linear-sgd"));
        assert!(matches!(reg.resolve("other").await, Err(RegistryError::NotFound(_))));
        assert_eq!(ledger.records_with_key("index").len(), 1);
    }

    #[tokio::test]
    async fn two_records_for_one_name_are_fatal() {
        let ledger = Arc::new(InMemoryLedger::new());
        for module in ["linear-sgd", "other"] {
            let p: Policy = demo(module).to_policy().unwrap();
            ledger.insert(&p).await.unwrap();
        }
        let reg = registry(ledger);
        assert!(matches!(reg.resolve("demo").await, Err(RegistryError::Inconsistent { count: 2, .. })));
    }

    #[tokio::test]
    async fn latest_aggregate_prefers_highest_round() {
        let ledger = Arc::new(InMemoryLedger::new());
        for round in [2, 5, 3] {
            let p = LatestAggregate { index: "demo".into(), round, artifact_path: format!("/a/demo-{round}-agg_update.json"), origin_address: "h:1".into() };
            ledger.insert(&p.to_policy().unwrap()).await.unwrap();
        }
        let reg = registry(ledger);
        assert_eq!(reg.latest_aggregate("demo").await.unwrap().map(|p| p.round), Some(5));
        assert_eq!(reg.latest_aggregate("none").await.unwrap(), None);
    }
}
