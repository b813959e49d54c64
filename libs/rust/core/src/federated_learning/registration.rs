//! Node registration: reserve a name, ask the node to start following the
//! index, then commit (or roll back) the slot.
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use ledgerfl_resilience::{CancelScope, RetryPolicy};

use super::records::{IndexRecord, RosterEntry};
use super::roster::node_name;
use super::state::{CoordinatorState, NodeInfo};
use crate::error::{FlError, RegistrationError};
use crate::ledger::http::USER_AGENT;
use crate::ledger::{idempotent_insert, Ledger};
use crate::metrics_ext::FL_METRICS;

/// Body of a node's `init-node` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitNodeRequest {
    pub replica_name: String,
    pub replica_ip: String,
    pub replica_port: u16,
    pub replica_index: String,
    pub round_number: u64,
    pub module_name: String,
    pub module_path: String,
    pub dataset_handle: String,
}

impl InitNodeRequest {
    pub fn for_node(url: &str, name: &str, record: &IndexRecord, round: u64) -> Result<Self, RegistrationError> {
        let parsed = reqwest::Url::parse(url).map_err(|_| RegistrationError::BadUrl(url.to_string()))?;
        let host = parsed.host_str().ok_or_else(|| RegistrationError::BadUrl(url.to_string()))?;
        let port = parsed.port_or_known_default().ok_or_else(|| RegistrationError::BadUrl(url.to_string()))?;
        Ok(Self {
            replica_name: name.to_string(),
            replica_ip: host.to_string(),
            replica_port: port,
            replica_index: record.name.clone(),
            round_number: round,
            module_name: record.module_name.clone(),
            module_path: record.module_path.clone(),
            dataset_handle: record.dataset_handle.clone(),
        })
    }
}

/// How the aggregator reaches a node's control API.
#[async_trait]
pub trait NodeEndpoint: Send + Sync {
    async fn init_node(&self, url: &str, req: &InitNodeRequest) -> Result<(), RegistrationError>;
}

pub struct HttpNodeEndpoint {
    client: reqwest::Client,
}

impl HttpNodeEndpoint {
    pub fn new(timeout: Duration) -> Result<Self, RegistrationError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| RegistrationError::Transport { url: String::new(), message: e.to_string() })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NodeEndpoint for HttpNodeEndpoint {
    async fn init_node(&self, url: &str, req: &InitNodeRequest) -> Result<(), RegistrationError> {
        let target = format!("{}/init-node", url.trim_end_matches('/'));
        let resp = self.client.post(&target).json(req).send().await.map_err(|e| {
            if e.is_connect() {
                RegistrationError::Unreachable { url: url.to_string(), message: e.to_string() }
            } else {
                RegistrationError::Transport { url: url.to_string(), message: e.to_string() }
            }
        })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RegistrationError::Rejected { url: url.to_string(), status: status.as_u16(), body });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RegistrationOptions {
    /// Delay between launching consecutive registration tasks.
    pub stagger: Duration,
    /// How long a call waits for each node. Also bounds the ledger writes
    /// of registration: roster entries and index records.
    pub timeout: Duration,
}

impl Default for RegistrationOptions {
    fn default() -> Self {
        Self { stagger: Duration::from_millis(100), timeout: Duration::from_secs(180) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedNode {
    pub url: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistrationReport {
    pub registered: Vec<NodeInfo>,
    /// Urls already in the roster (or being registered by another call).
    pub skipped: Vec<String>,
    pub failed: Vec<FailedNode>,
    /// Urls that had not answered when the call returned. Their registration
    /// keeps running and holds its name until the node replies.
    pub pending: Vec<String>,
}

enum Outcome {
    Registered(NodeInfo),
    Skipped,
    Failed(String),
}

/// Settles a reserved slot. Without an explicit `commit` or `release` the
/// slot is retired: the node may already follow the index under its name.
struct SlotGuard {
    state: Arc<CoordinatorState>,
    index: String,
    url: String,
    slot: Option<usize>,
}

impl SlotGuard {
    fn commit(mut self) -> Result<String, FlError> {
        let slot = self.slot.take().ok_or_else(|| FlError::InvalidRequest(format!("slot for {} already settled", self.url)))?;
        self.state.commit_slot(&self.index, &self.url, slot)
    }

    /// The node never acted on the request; its name may be reused.
    fn release(mut self) {
        if let Some(slot) = self.slot.take() {
            self.state.release_slot(&self.index, &self.url, slot);
            warn!(index = %self.index, url = %self.url, slot, "registration rolled back");
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.state.retire_slot(&self.index, &self.url, slot);
            warn!(index = %self.index, url = %self.url, node = %node_name(slot), "registration unsettled; name retired");
        }
    }
}

#[derive(Clone)]
struct Registrar {
    state: Arc<CoordinatorState>,
    endpoint: Arc<dyn NodeEndpoint>,
    ledger: Arc<dyn Ledger>,
    policy: RetryPolicy,
    record: IndexRecord,
    round: u64,
    timeout: Duration,
}

impl Registrar {
    async fn register(self, url: String) -> Outcome {
        let outcome = self.attempt(url).await;
        match &outcome {
            Outcome::Registered(_) => FL_METRICS.registration.nodes_registered_total.add(1, &[]),
            Outcome::Failed(_) => FL_METRICS.registration.registration_failures_total.add(1, &[]),
            Outcome::Skipped => {}
        }
        outcome
    }

    async fn attempt(&self, url: String) -> Outcome {
        let index = self.record.name.clone();
        let slot = match self.state.reserve_slot(&index, &url) {
            Ok(Some(slot)) => slot,
            Ok(None) => return Outcome::Skipped,
            Err(e) => return Outcome::Failed(e.to_string()),
        };
        let guard = SlotGuard { state: self.state.clone(), index: index.clone(), url: url.clone(), slot: Some(slot) };
        let name = node_name(slot);

        let req = match InitNodeRequest::for_node(&url, &name, &self.record, self.round) {
            Ok(req) => req,
            Err(e) => {
                guard.release();
                return Outcome::Failed(e.to_string());
            }
        };
        if let Err(e) = self.endpoint.init_node(&url, &req).await {
            warn!(%index, %url, error = %e, "node registration failed");
            if e.is_definite() {
                guard.release();
            }
            return Outcome::Failed(e.to_string());
        }

        // The node follows under `name` from here on, so the name is either
        // committed or retired, never released.
        let entry = RosterEntry { index: index.clone(), node_name: name.clone(), node_url: url.clone() };
        let scope = CancelScope::unbounded().with_timeout(Some(self.timeout));
        if let Err(e) = idempotent_insert(self.ledger.as_ref(), &entry, &self.policy, &scope).await {
            warn!(%index, %url, node = %name, error = %e, "roster entry not persisted");
            return Outcome::Failed(format!("roster entry not persisted: {e}"));
        }
        let name = match guard.commit() {
            Ok(name) => name,
            Err(e) => return Outcome::Failed(e.to_string()),
        };
        info!(%index, %url, node = %name, "node registered");
        Outcome::Registered(NodeInfo { name, url })
    }
}

/// Registers each url concurrently (one task per url, staggered) and joins
/// every task with a bounded wait. A task still waiting on its node is left
/// running and reported as pending. Only an unknown index fails the call.
#[allow(clippy::too_many_arguments)]
pub async fn initialize_nodes(
    state: Arc<CoordinatorState>,
    endpoint: Arc<dyn NodeEndpoint>,
    ledger: Arc<dyn Ledger>,
    policy: RetryPolicy,
    index: &str,
    round: u64,
    urls: Vec<String>,
    opts: RegistrationOptions,
) -> Result<RegistrationReport, FlError> {
    let record = state.record(index)?;
    let registrar = Registrar { state, endpoint, ledger, policy, record, round, timeout: opts.timeout };

    let mut seen = HashSet::new();
    let urls: Vec<String> = urls.into_iter().filter(|u| seen.insert(u.clone())).collect();
    let mut tasks: Vec<(String, JoinHandle<Outcome>)> = Vec::with_capacity(urls.len());
    for (i, url) in urls.into_iter().enumerate() {
        if i > 0 && !opts.stagger.is_zero() {
            tokio::time::sleep(opts.stagger).await;
        }
        let handle = tokio::spawn(registrar.clone().register(url.clone()));
        tasks.push((url, handle));
    }

    let mut report = RegistrationReport::default();
    for (url, mut handle) in tasks {
        match tokio::time::timeout(opts.timeout, &mut handle).await {
            Ok(Ok(Outcome::Registered(node))) => report.registered.push(node),
            Ok(Ok(Outcome::Skipped)) => report.skipped.push(url),
            Ok(Ok(Outcome::Failed(error))) => report.failed.push(FailedNode { url, error }),
            Ok(Err(join)) => report.failed.push(FailedNode { url, error: format!("registration task failed: {join}") }),
            Err(_) => {
                warn!(%index, %url, timeout_secs = opts.timeout.as_secs(), "node has not answered; registration continues");
                report.pending.push(url);
            }
        }
    }
    Ok(report)
}
