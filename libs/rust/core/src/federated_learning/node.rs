//! Node process facade: the `init-node` control call and one follower loop
//! per joined index.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

use ledgerfl_resilience::{CancelScope, RetryPolicy};

use super::follower::{FollowerStatus, RoundFollower};
use super::registration::InitNodeRequest;
use super::supervisor::ListenerSupervisor;
use super::PartyContext;
use crate::artifact::ArtifactStore;
use crate::error::{ArtifactError, FlError};
use crate::ledger::Ledger;
use crate::training::{AppContext, TrainingAppRegistry};

/// Builds the artifact store for a replica name.
pub type StoreFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn ArtifactStore>, ArtifactError> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// Address peers pull this node's artifacts from; defaults to the
    /// address the aggregator registered.
    pub external_address: Option<String>,
    pub artifact_retry_delay: Duration,
    pub join_timeout: Duration,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self { external_address: None, artifact_retry_delay: Duration::from_secs(1), join_timeout: Duration::from_secs(1) }
    }
}

pub struct NodeRuntime {
    ledger: Arc<dyn Ledger>,
    policy: RetryPolicy,
    apps: TrainingAppRegistry,
    store_factory: StoreFactory,
    options: NodeOptions,
    followers: ListenerSupervisor,
    statuses: Mutex<HashMap<String, Arc<Mutex<FollowerStatus>>>>,
}

impl NodeRuntime {
    pub fn new(ledger: Arc<dyn Ledger>, policy: RetryPolicy, apps: TrainingAppRegistry, store_factory: StoreFactory, options: NodeOptions) -> Self {
        let followers = ListenerSupervisor::new(options.join_timeout);
        Self { ledger, policy, apps, store_factory, options, followers, statuses: Mutex::new(HashMap::new()) }
    }

    /// Starts following `req.replica_index`. A follower already running for
    /// the index is stopped first (bounded join), so re-initialising a node
    /// never leaves two loops publishing for it.
    pub async fn init_node(&self, req: InitNodeRequest) -> Result<(), FlError> {
        if req.replica_name.trim().is_empty() || req.replica_index.trim().is_empty() {
            return Err(FlError::InvalidRequest("replica name and index are required".into()));
        }
        let app = self.apps.create(&req.module_name, &AppContext {
            index: req.replica_index.clone(),
            replica: Some(req.replica_name.clone()),
            dataset_handle: req.dataset_handle.clone(),
        })?;
        let store = (self.store_factory)(&req.replica_name)?;
        store.prepare().await?;

        let address = self.options.external_address.clone().unwrap_or_else(|| format!("{}:{}", req.replica_ip, req.replica_port));
        let ctx = PartyContext {
            ledger: self.ledger.clone(),
            store,
            policy: self.policy.clone(),
            address,
            artifact_retry_delay: self.options.artifact_retry_delay,
        };
        let follower = RoundFollower::new(ctx, &req.replica_index, &req.replica_name, app);
        self.statuses.lock().insert(req.replica_index.clone(), follower.status_handle());

        let starting_round = req.round_number;
        self.followers
            .replace(&req.replica_index, move |stop| async move {
                let _ = follower.run(starting_round, CancelScope::new(stop)).await;
            })
            .await;
        info!(index = %req.replica_index, node = %req.replica_name, round = starting_round, "node initialised");
        Ok(())
    }

    /// Followers ordered by index.
    pub fn status(&self) -> Vec<FollowerStatus> {
        let mut all: Vec<FollowerStatus> = self.statuses.lock().values().map(|s| s.lock().clone()).collect();
        all.sort_by(|a, b| a.index.cmp(&b.index));
        all
    }

    pub async fn is_following(&self, index: &str) -> bool { self.followers.is_running(index).await }

    pub async fn shutdown(&self) { self.followers.stop_all().await; }
}
