//! Aggregator process facade: the operations behind the aggregator's control
//! API, one coordinator session per index.
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use ledgerfl_resilience::{CancelScope, Quorum};

use super::coordinator::RoundCoordinator;
use super::records::IndexRecord;
use super::registration::{initialize_nodes, NodeEndpoint, RegistrationOptions, RegistrationReport};
use super::roster::Roster;
use super::state::{CoordinatorState, IndexStatus};
use super::supervisor::ListenerSupervisor;
use super::PartyContext;
use crate::error::{FlError, RegistryError, TrainingError};
use crate::registry::IndexRegistry;
use crate::training::{AppContext, TrainingAppRegistry};

#[derive(Debug, Clone, Copy)]
pub struct AggregatorOptions {
    pub registration: RegistrationOptions,
    /// Per-round bound; `None` polls until the round completes or is stopped.
    pub round_deadline: Option<Duration>,
    /// How long a stopped session may take to wind down before it is aborted.
    pub join_timeout: Duration,
}

impl Default for AggregatorOptions {
    fn default() -> Self {
        Self { registration: RegistrationOptions::default(), round_deadline: None, join_timeout: Duration::from_secs(1) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexOrigin {
    Created,
    /// Already in the ledger (e.g. after an aggregator restart); roster rebuilt from it.
    Adopted,
}

/// Rounds a started session will run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrainingSession {
    pub index: String,
    pub first_round: u64,
    pub last_round: u64,
    pub min_participants: usize,
    pub effective_min_participants: usize,
}

pub struct Aggregator {
    ctx: PartyContext,
    state: Arc<CoordinatorState>,
    registry: IndexRegistry,
    apps: TrainingAppRegistry,
    endpoint: Arc<dyn NodeEndpoint>,
    sessions: ListenerSupervisor,
    options: AggregatorOptions,
}

impl Aggregator {
    pub fn new(ctx: PartyContext, apps: TrainingAppRegistry, endpoint: Arc<dyn NodeEndpoint>, options: AggregatorOptions) -> Self {
        let registry = IndexRegistry::new(ctx.ledger.clone(), ctx.policy.clone());
        Self {
            state: Arc::new(CoordinatorState::new()),
            registry,
            apps,
            endpoint,
            sessions: ListenerSupervisor::new(options.join_timeout),
            options,
            ctx,
        }
    }

    pub fn state(&self) -> &Arc<CoordinatorState> { &self.state }

    /// Creates the index, or adopts the ledger's record when another (or an
    /// earlier) aggregator process already registered it.
    pub async fn register_index(&self, record: IndexRecord) -> Result<IndexOrigin, FlError> {
        if record.name.trim().is_empty() {
            return Err(FlError::InvalidRequest("index name must not be empty".into()));
        }
        if !self.apps.contains(&record.module_name) {
            return Err(TrainingError::UnknownModule(record.module_name).into());
        }
        if self.state.is_known(&record.name) {
            return Err(RegistryError::AlreadyRegistered(record.name).into());
        }
        let scope = CancelScope::unbounded().with_timeout(Some(self.options.registration.timeout));
        match self.registry.register(&record, &scope).await {
            Ok(_) => {
                self.state.track(record, Roster::new());
                Ok(IndexOrigin::Created)
            }
            Err(RegistryError::AlreadyRegistered(name)) => {
                let existing = self.registry.resolve(&name).await?;
                if existing != record {
                    warn!(index = %name, module = %existing.module_name, "index exists with different attributes; keeping ledger record");
                }
                let entries = self.registry.roster_entries(&name).await?;
                let roster = Roster::rehydrate(&entries);
                info!(index = %name, nodes = roster.size(), node_count = roster.node_count(), "adopted registered index");
                if !self.state.track(existing, roster) {
                    return Err(RegistryError::AlreadyRegistered(name).into());
                }
                Ok(IndexOrigin::Adopted)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Registers nodes; they start following at the index's current round.
    pub async fn add_nodes(&self, index: &str, urls: Vec<String>) -> Result<RegistrationReport, FlError> {
        if urls.is_empty() {
            return Err(FlError::InvalidRequest("no node urls given".into()));
        }
        let round = self.state.current_round(index)?.max(1);
        initialize_nodes(
            self.state.clone(),
            self.endpoint.clone(),
            self.ctx.ledger.clone(),
            self.ctx.policy.clone(),
            index,
            round,
            urls,
            self.options.registration,
        )
        .await
    }

    pub async fn start_training(&self, index: &str, total_rounds: u64, min_participants: usize) -> Result<TrainingSession, FlError> {
        if total_rounds == 0 {
            return Err(FlError::InvalidRequest("total rounds must be positive".into()));
        }
        self.launch(index, 1, total_rounds, String::new(), min_participants).await
    }

    /// Runs `additional` rounds after the last persisted aggregate, seeded with it.
    pub async fn continue_training(&self, index: &str, additional_rounds: u64, min_participants: usize) -> Result<TrainingSession, FlError> {
        if additional_rounds == 0 {
            return Err(FlError::InvalidRequest("additional rounds must be positive".into()));
        }
        self.state.record(index)?;
        let latest = self.registry.latest_aggregate(index).await?.ok_or_else(|| FlError::NoPreviousTraining(index.to_string()))?;
        info!(%index, last_round = latest.round, artifact = %latest.artifact_path, "continuing from latest aggregate");
        self.launch(index, latest.round + 1, latest.round + additional_rounds, latest.artifact_path, min_participants).await
    }

    async fn launch(&self, index: &str, first: u64, last: u64, init_params: String, min_participants: usize) -> Result<TrainingSession, FlError> {
        if min_participants == 0 {
            return Err(FlError::InvalidRequest("min participants must be at least 1".into()));
        }
        let record = self.state.record(index)?;
        if self.sessions.is_running(index).await {
            return Err(FlError::TrainingInProgress(index.to_string()));
        }
        let app = self.apps.create(&record.module_name, &AppContext { index: index.to_string(), replica: None, dataset_handle: record.dataset_handle.clone() })?;
        let quorum = self.state.set_min_participants(index, min_participants)?;
        if quorum.downgraded() {
            warn!(%index, min = quorum.requested, roster = quorum.effective, "min participants exceeds roster; clamping");
        }

        let coordinator = RoundCoordinator::new(self.ctx.clone(), self.state.clone(), index, app).with_round_deadline(self.options.round_deadline);
        let state = self.state.clone();
        let key = index.to_string();
        let started = self.sessions.start_if_idle(index, move |stop| async move {
            let scope = CancelScope::new(stop);
            match coordinator.run(first, last, init_params, &scope).await {
                Ok(_) => return,
                Err(e) => match e.interruption() {
                    Some(reason) => warn!(index = %key, ?reason, "training interrupted"),
                    None => error!(index = %key, error = %e, "training aborted"),
                },
            }
            let _ = state.transition(&key, |t| {
                t.idle();
                Ok(())
            });
        }).await;
        if !started {
            return Err(FlError::TrainingInProgress(index.to_string()));
        }
        info!(%index, first, last, min = quorum.effective, "training started");
        Ok(TrainingSession {
            index: index.to_string(),
            first_round: first,
            last_round: last,
            min_participants: quorum.requested,
            effective_min_participants: quorum.effective,
        })
    }

    /// Changes the threshold used from the next quorum check on. The index
    /// must exist in the ledger as well as locally.
    pub async fn update_min_participants(&self, index: &str, min_participants: usize) -> Result<Quorum, FlError> {
        if min_participants == 0 {
            return Err(FlError::InvalidRequest("min participants must be at least 1".into()));
        }
        self.state.record(index)?;
        self.registry.resolve(index).await?;
        let quorum = self.state.set_min_participants(index, min_participants)?;
        info!(%index, min = quorum.requested, effective = quorum.effective, "min participants updated");
        Ok(quorum)
    }

    /// Signals the index's session to stop; `false` when none was running.
    pub async fn stop_training(&self, index: &str) -> Result<bool, FlError> {
        self.state.record(index)?;
        let signalled = self.sessions.signal(index).await;
        if signalled {
            info!(%index, "stop requested");
        }
        Ok(signalled)
    }

    pub async fn status(&self, index: &str) -> Result<IndexStatus, FlError> {
        let active = self.sessions.is_running(index).await;
        self.state.status(index, active)
    }

    pub fn indices(&self) -> Vec<String> { self.state.indices() }

    /// Waits until no session runs for `index`.
    pub async fn wait_idle(&self, index: &str) {
        self.sessions.wait_idle(index, self.ctx.policy.poll_interval).await;
    }

    pub async fn shutdown(&self) { self.sessions.stop_all().await; }
}
