use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use ledgerfl_resilience::{retry_with_jitter, CancelScope};

use super::records::{announcement_key, node_result_key, NodeResult, RoundAnnouncement};
use super::PartyContext;
use crate::artifact::{fetch_envelope, publish_envelope, replica_file_name, ArtifactEnvelope};
use crate::error::FlError;
use crate::ledger::{idempotent_insert, InsertAck, LedgerRecord, Query};
use crate::lifecycle::FollowerPhase;
use crate::metrics_ext::FL_METRICS;
use crate::training::TrainingApplication;

/// Round counter and phase of one follower, shared with status calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FollowerStatus {
    pub index: String,
    pub replica: String,
    pub round: u64,
    pub phase: FollowerPhase,
    pub last_published: Option<u64>,
}

/// A node's loop for one index: wait for the round, train, publish, advance.
pub struct RoundFollower {
    ctx: PartyContext,
    index: String,
    name: String,
    app: Box<dyn TrainingApplication>,
    status: Arc<Mutex<FollowerStatus>>,
}

impl RoundFollower {
    pub fn new(ctx: PartyContext, index: impl Into<String>, name: impl Into<String>, app: Box<dyn TrainingApplication>) -> Self {
        let index = index.into();
        let name = name.into();
        let status = FollowerStatus { index: index.clone(), replica: name.clone(), round: 0, phase: FollowerPhase::Resuming, last_published: None };
        Self { ctx, index, name, app, status: Arc::new(Mutex::new(status)) }
    }

    pub fn status_handle(&self) -> Arc<Mutex<FollowerStatus>> { self.status.clone() }

    fn set(&self, round: u64, phase: FollowerPhase) {
        let mut s = self.status.lock();
        s.round = round;
        s.phase = phase;
    }

    /// First round at or after `starting_round` this node has not yet published.
    pub async fn resume_round(&self, starting_round: u64, scope: &CancelScope) -> Result<u64, FlError> {
        let mut round = starting_round.max(1);
        loop {
            let q = Query::key(node_result_key(&self.index, round)).and_eq("node_id", &self.name);
            let q = &q;
            let ledger = self.ctx.ledger.as_ref();
            let published = retry_with_jitter(&self.ctx.policy, scope, "resume scan", move || ledger.count(q)).await?;
            if published == 0 {
                if round > starting_round.max(1) {
                    info!(index = %self.index, node = %self.name, round, "resuming after already published rounds");
                }
                return Ok(round);
            }
            self.status.lock().last_published = Some(round);
            round += 1;
        }
    }

    /// Waits until the announcement for `round` is visible. No match means
    /// "not yet", never an error.
    pub async fn poll_announcement(&self, round: u64, scope: &CancelScope) -> Result<RoundAnnouncement, FlError> {
        let query = Query::key(announcement_key(&self.index, round));
        loop {
            scope.check()?;
            match self.ctx.ledger.get(&query).await {
                Ok(found) => {
                    if let Some(ann) = found.iter().find_map(|r| RoundAnnouncement::from_record(r).ok()) {
                        debug!(index = %self.index, node = %self.name, round, "announcement found");
                        return Ok(ann);
                    }
                    debug!(index = %self.index, node = %self.name, round, "round not announced yet");
                }
                Err(e) => warn!(index = %self.index, node = %self.name, round, error = %e, "announcement poll failed"),
            }
            scope.sleep(self.ctx.policy.poll_interval).await?;
        }
    }

    /// Loads the announced weights, trains, stores the artifact and publishes
    /// this node's result for the round.
    pub async fn complete_round(&mut self, ann: &RoundAnnouncement, scope: &CancelScope) -> Result<InsertAck, FlError> {
        let round = ann.round;
        if ann.init_params.is_empty() {
            if round != 1 {
                warn!(index = %self.index, node = %self.name, round, "announcement carries no weights; training from current model");
            }
        } else {
            let env = fetch_envelope(self.ctx.store.as_ref(), &ann.init_params, &ann.origin_address, self.ctx.artifact_retry_delay).await?;
            self.app.update_model(env.weights)?;
        }
        scope.check()?;

        self.set(round, FollowerPhase::Train);
        let started = Instant::now();
        let update = self.app.train(round).await?;
        FL_METRICS.rounds.local_training_latency_ms.record(started.elapsed().as_secs_f64() * 1000.0, &[]);

        self.set(round, FollowerPhase::Publish);
        let envelope = ArtifactEnvelope {
            index: self.index.clone(),
            round,
            producer: self.name.clone(),
            sample_count: update.sample_count,
            weights: update.weights,
        };
        let remote = publish_envelope(self.ctx.store.as_ref(), &envelope, &replica_file_name(&self.index, round, &self.name)).await?;
        let result = NodeResult::new(&self.index, round, &self.name, &self.ctx.address, &remote);
        let ack = idempotent_insert(self.ctx.ledger.as_ref(), &result, &self.ctx.policy, scope).await?;
        FL_METRICS.rounds.node_results_total.add(1, &[]);
        info!(index = %self.index, node = %self.name, round, ?ack, "node result published");
        Ok(ack)
    }

    /// Follows rounds from the resume point until `scope` stops it. The
    /// round counter advances only after the result is confirmed.
    pub async fn run(mut self, starting_round: u64, scope: CancelScope) -> Result<(), FlError> {
        let res = self.follow(starting_round, &scope).await;
        self.status.lock().phase = FollowerPhase::Stopped;
        match &res {
            Err(e) if e.interruption().is_some() => info!(index = %self.index, node = %self.name, "follower stopped"),
            Err(e) => error!(index = %self.index, node = %self.name, error = %e, "follower exited"),
            Ok(()) => {}
        }
        res
    }

    async fn follow(&mut self, starting_round: u64, scope: &CancelScope) -> Result<(), FlError> {
        let mut round = self.resume_round(starting_round, scope).await?;
        loop {
            self.set(round, FollowerPhase::WaitRound);
            let ann = self.poll_announcement(round, scope).await?;
            match self.complete_round(&ann, scope).await {
                Ok(_) => {
                    self.status.lock().last_published = Some(round);
                    round += 1;
                }
                Err(e) if e.interruption().is_some() => return Err(e),
                Err(e) => {
                    error!(index = %self.index, node = %self.name, round, error = %e, "round failed; retrying");
                    scope.sleep(self.ctx.policy.poll_interval).await?;
                }
            }
        }
    }
}
