//! Round-coordination protocol over the ledger.
//!
//! The aggregator runs one [`RoundCoordinator`] per active index and each
//! node runs one [`RoundFollower`] per index it joined. They never talk to
//! each other: round parameters and results are ledger records, weights move
//! through the artifact store.

pub mod aggregator;
pub mod coordinator;
pub mod follower;
pub mod node;
pub mod records;
pub mod registration;
pub mod roster;
pub mod state;
pub mod supervisor;

use std::sync::Arc;
use std::time::Duration;

use ledgerfl_resilience::RetryPolicy;

use crate::artifact::ArtifactStore;
use crate::ledger::Ledger;

pub use aggregator::{Aggregator, AggregatorOptions, IndexOrigin, TrainingSession};
pub use coordinator::RoundCoordinator;
pub use follower::{FollowerStatus, RoundFollower};
pub use node::{NodeOptions, NodeRuntime, StoreFactory};
pub use records::{IndexRecord, LatestAggregate, NodeResult, RosterEntry, RoundAnnouncement};
pub use registration::{initialize_nodes, FailedNode, HttpNodeEndpoint, InitNodeRequest, NodeEndpoint, RegistrationOptions, RegistrationReport};
pub use roster::Roster;
pub use state::{CoordinatorState, IndexStatus, NodeInfo};
pub use supervisor::ListenerSupervisor;

/// What every party needs to take part in rounds.
#[derive(Clone)]
pub struct PartyContext {
    pub ledger: Arc<dyn Ledger>,
    pub store: Arc<dyn ArtifactStore>,
    pub policy: RetryPolicy,
    /// Ledger node address (host:port) peers pull this party's artifacts from.
    pub address: String,
    pub artifact_retry_delay: Duration,
}
