use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tracing::{debug, error, info, warn};

use ledgerfl_resilience::{CancelScope, Quorum};

use super::records::{node_result_key, LatestAggregate, NodeResult, RoundAnnouncement};
use super::state::CoordinatorState;
use super::PartyContext;
use crate::artifact::{aggregate_file_name, fetch_envelope, publish_envelope, ArtifactEnvelope};
use crate::error::FlError;
use crate::ledger::{idempotent_insert, replace_pointer, LedgerRecord, Query};
use crate::metrics_ext::FL_METRICS;
use crate::training::{canonical_order, NodeUpdate, TrainingApplication};

pub const AGGREGATOR_PRODUCER: &str = "aggregator";

/// Drives the rounds of one index on the aggregator.
pub struct RoundCoordinator {
    ctx: PartyContext,
    state: Arc<CoordinatorState>,
    index: String,
    app: Box<dyn TrainingApplication>,
    round_deadline: Option<Duration>,
}

impl RoundCoordinator {
    pub fn new(ctx: PartyContext, state: Arc<CoordinatorState>, index: impl Into<String>, app: Box<dyn TrainingApplication>) -> Self {
        Self { ctx, state, index: index.into(), app, round_deadline: None }
    }

    /// Bounds each round (announcement through pointer update) by `deadline`.
    pub fn with_round_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.round_deadline = deadline;
        self
    }

    pub fn index(&self) -> &str { &self.index }

    /// Publishes the announcement for `round`; the round state moves only
    /// once the write is confirmed.
    pub async fn start_round(&self, round: u64, init_params: &str, scope: &CancelScope) -> Result<(), FlError> {
        let ann = RoundAnnouncement::new(&self.index, round, init_params, &self.ctx.address);
        let ack = idempotent_insert(self.ctx.ledger.as_ref(), &ann, &self.ctx.policy, scope).await?;
        self.state.transition(&self.index, |t| t.round_started(round))?;
        FL_METRICS.rounds.rounds_started_total.add(1, &[KeyValue::new("index", self.index.clone())]);
        info!(index = %self.index, round, ?ack, "round started");
        Ok(())
    }

    /// Results for `round`, one per node; malformed records are skipped.
    async fn distinct_results(&self, round: u64) -> Result<Vec<NodeResult>, FlError> {
        let records = self.ctx.ledger.get(&Query::key(node_result_key(&self.index, round))).await?;
        let mut seen = HashSet::new();
        let mut results = Vec::with_capacity(records.len());
        for rec in &records {
            match NodeResult::from_record(rec) {
                Ok(r) if seen.insert(r.node_id.clone()) => results.push(r),
                Ok(r) => debug!(index = %self.index, round, node = %r.node_id, "duplicate node result"),
                Err(e) => warn!(index = %self.index, round, error = %e, "skipping malformed node result"),
            }
        }
        Ok(results)
    }

    /// Polls the result count for `round` until it reaches the threshold,
    /// re-reading (and re-clamping) the threshold on every check. A raw count
    /// at the threshold is confirmed against distinct nodes before returning.
    pub async fn await_quorum(&self, round: u64, scope: &CancelScope) -> Result<usize, FlError> {
        self.state.transition(&self.index, |t| t.awaiting_quorum())?;
        let started = Instant::now();
        let query = Query::key(node_result_key(&self.index, round));
        let mut last_downgrade: Option<Quorum> = None;
        loop {
            scope.check()?;
            let quorum = self.state.quorum(&self.index)?;
            if quorum.downgraded() && last_downgrade != Some(quorum) {
                FL_METRICS.rounds.quorum_downgrades_total.add(1, &[]);
                warn!(index = %self.index, round, min = quorum.requested, roster = quorum.effective, "min participants exceeds roster; clamping");
            }
            last_downgrade = quorum.downgraded().then_some(quorum);
            let distinct = match self.ctx.ledger.count(&query).await {
                Ok(count) if quorum.is_met(count) => self.distinct_results(round).await.map(|r| r.len()),
                Ok(count) => Ok(count),
                Err(e) => Err(e.into()),
            };
            match distinct {
                Ok(count) if quorum.is_met(count) => {
                    FL_METRICS.rounds.quorum_wait_latency_ms.record(started.elapsed().as_secs_f64() * 1000.0, &[]);
                    info!(index = %self.index, round, count, min = quorum.effective, "quorum reached");
                    return Ok(count);
                }
                Ok(count) => debug!(index = %self.index, round, count, min = quorum.effective, "waiting for results"),
                Err(e) => warn!(index = %self.index, round, error = %e, "result count failed"),
            }
            scope.sleep(self.ctx.policy.poll_interval).await?;
        }
    }

    /// Fetches every published result for `round`, fuses them in node-id
    /// order, stores the aggregate and moves the latest-aggregate pointer.
    /// Returns the aggregate's remote path.
    pub async fn aggregate(&self, round: u64, scope: &CancelScope) -> Result<String, FlError> {
        self.state.transition(&self.index, |t| t.aggregating())?;
        let started = Instant::now();
        let results = self.distinct_results(round).await?;
        let required = self.state.quorum(&self.index)?.effective;
        if results.len() < required {
            return Err(FlError::QuorumNotMet { index: self.index.clone(), round, distinct: results.len(), required });
        }
        let mut updates = Vec::with_capacity(results.len());
        for result in results {
            scope.check()?;
            let env = fetch_envelope(self.ctx.store.as_ref(), &result.artifact_path, &result.node_address, self.ctx.artifact_retry_delay).await?;
            updates.push(NodeUpdate { node_id: result.node_id, weights: env.weights, sample_count: env.sample_count });
        }
        let updates = canonical_order(updates);
        let participants = updates.len();
        let fused = self.app.aggregate(&updates)?;
        let envelope = ArtifactEnvelope {
            index: self.index.clone(),
            round,
            producer: AGGREGATOR_PRODUCER.into(),
            sample_count: updates.iter().map(|u| u.sample_count).sum(),
            weights: fused,
        };
        let remote = publish_envelope(self.ctx.store.as_ref(), &envelope, &aggregate_file_name(&self.index, round)).await?;
        let pointer = LatestAggregate { index: self.index.clone(), round, artifact_path: remote.clone(), origin_address: self.ctx.address.clone() };
        replace_pointer(self.ctx.ledger.as_ref(), &pointer, &self.ctx.policy, scope).await?;

        FL_METRICS.rounds.aggregations_total.add(1, &[KeyValue::new("index", self.index.clone())]);
        FL_METRICS.rounds.participants_total.add(participants as u64, &[]);
        FL_METRICS.rounds.aggregation_latency_ms.record(started.elapsed().as_secs_f64() * 1000.0, &[]);
        info!(index = %self.index, round, participants, artifact = %remote, "round aggregated");
        Ok(remote)
    }

    /// Runs rounds `first..=last`, seeding `first` with `init_params`.
    /// A failed aggregation is logged and the round goes back to polling.
    pub async fn run(&self, first: u64, last: u64, init_params: String, scope: &CancelScope) -> Result<Option<String>, FlError> {
        let mut params = init_params;
        let mut latest = None;
        for round in first..=last {
            let scope = &scope.clone().with_timeout(self.round_deadline);
            self.start_round(round, &params, scope).await?;
            let remote = loop {
                self.await_quorum(round, scope).await?;
                match self.aggregate(round, scope).await {
                    Ok(remote) => break remote,
                    Err(e) if e.interruption().is_some() => return Err(e),
                    Err(e) => {
                        FL_METRICS.rounds.aggregation_failures_total.add(1, &[]);
                        error!(index = %self.index, round, error = %e, "aggregation failed; polling again");
                        scope.sleep(self.ctx.policy.poll_interval).await?;
                    }
                }
            };
            params = remote.clone();
            latest = Some(remote);
        }
        self.state.transition(&self.index, |t| t.done())?;
        info!(index = %self.index, first, last, "training finished");
        Ok(latest)
    }
}
