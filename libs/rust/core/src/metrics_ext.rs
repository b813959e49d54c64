//! Metric groups for the ledger client and the round protocol.

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter};

pub struct LedgerMetrics {
    pub inserts_total: Counter<u64>,
    pub insert_retries_total: Counter<u64>,
    pub confirmed_by_readback_total: Counter<u64>,
    pub pointer_replacements_total: Counter<u64>,
}

pub struct RoundMetrics {
    pub rounds_started_total: Counter<u64>,
    pub aggregations_total: Counter<u64>,
    pub aggregation_failures_total: Counter<u64>,
    pub quorum_downgrades_total: Counter<u64>,
    pub node_results_total: Counter<u64>,
    pub participants_total: Counter<u64>,
    pub quorum_wait_latency_ms: Histogram<f64>,
    pub aggregation_latency_ms: Histogram<f64>,
    pub local_training_latency_ms: Histogram<f64>,
}

pub struct ArtifactMetrics {
    pub transfers_total: Counter<u64>,
    pub transfer_failures_total: Counter<u64>,
}

pub struct RegistrationMetrics {
    pub nodes_registered_total: Counter<u64>,
    pub registration_failures_total: Counter<u64>,
}

pub struct FlMetrics {
    pub ledger: LedgerMetrics,
    pub rounds: RoundMetrics,
    pub artifacts: ArtifactMetrics,
    pub registration: RegistrationMetrics,
}

static FL_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("ledgerfl"));

pub static FL_METRICS: Lazy<FlMetrics> = Lazy::new(|| FlMetrics {
    ledger: LedgerMetrics {
        inserts_total: FL_METER.u64_counter("ledgerfl_ledger_inserts_total").with_description("Ledger insert attempts").build(),
        insert_retries_total: FL_METER.u64_counter("ledgerfl_ledger_insert_retries_total").with_description("Insert attempts that were retried after a failure").build(),
        confirmed_by_readback_total: FL_METER.u64_counter("ledgerfl_ledger_confirmed_by_readback_total").with_description("Inserts reported failed but found visible on read-back").build(),
        pointer_replacements_total: FL_METER.u64_counter("ledgerfl_ledger_pointer_replacements_total").with_description("Latest-aggregate pointer rewrites").build(),
    },
    rounds: RoundMetrics {
        rounds_started_total: FL_METER.u64_counter("ledgerfl_rounds_started_total").with_description("Round announcements published").build(),
        aggregations_total: FL_METER.u64_counter("ledgerfl_aggregations_total").with_description("Rounds aggregated").build(),
        aggregation_failures_total: FL_METER.u64_counter("ledgerfl_aggregation_failures_total").with_description("Aggregation attempts that failed and returned to polling").build(),
        quorum_downgrades_total: FL_METER.u64_counter("ledgerfl_quorum_downgrades_total").with_description("Quorum checks clamped below the requested minimum").build(),
        node_results_total: FL_METER.u64_counter("ledgerfl_node_results_total").with_description("Node results published").build(),
        participants_total: FL_METER.u64_counter("ledgerfl_participants_total").with_description("Node updates fused into aggregates").build(),
        quorum_wait_latency_ms: FL_METER.f64_histogram("ledgerfl_quorum_wait_latency_ms").with_description("Time from round announcement to quorum").with_unit("ms").build(),
        aggregation_latency_ms: FL_METER.f64_histogram("ledgerfl_aggregation_latency_ms").with_description("Fetch plus fuse latency per round").with_unit("ms").build(),
        local_training_latency_ms: FL_METER.f64_histogram("ledgerfl_local_training_latency_ms").with_description("Local training latency per round").with_unit("ms").build(),
    },
    artifacts: ArtifactMetrics {
        transfers_total: FL_METER.u64_counter("ledgerfl_artifact_transfers_total").with_description("Artifact store and retrieve operations").build(),
        transfer_failures_total: FL_METER.u64_counter("ledgerfl_artifact_transfer_failures_total").with_description("Artifact transfers that failed").build(),
    },
    registration: RegistrationMetrics {
        nodes_registered_total: FL_METER.u64_counter("ledgerfl_nodes_registered_total").with_description("Nodes initialized by the aggregator").build(),
        registration_failures_total: FL_METER.u64_counter("ledgerfl_registration_failures_total").with_description("Node initializations that failed or timed out").build(),
    },
});
