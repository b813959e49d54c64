//! Artifact Transfer: moves serialized weights between parties out of band.
//!
//! Only a pointer (producer address plus remote path) travels through the
//! ledger. The bytes move through an [`ArtifactStore`].

pub mod shared_dir;
pub mod transfer;
pub mod workspace;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use ledgerfl_resilience::retry_async;

use crate::error::ArtifactError;
use crate::metrics_ext::FL_METRICS;
use crate::training::ModelWeights;

pub use shared_dir::SharedDirStore;
pub use transfer::LedgerFileTransfer;
pub use workspace::Workspace;

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Directory where this party writes artifacts before storing them.
    fn staging_dir(&self) -> PathBuf;

    /// Creates whatever directories `store` and `retrieve` write into.
    async fn prepare(&self) -> Result<(), ArtifactError> {
        let dir = self.staging_dir();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| ArtifactError::io(&dir, e))
    }

    /// Makes a staged file reachable by peers; returns the path they request.
    async fn store(&self, local: &Path) -> Result<String, ArtifactError>;

    /// Pulls `remote` from `peer` and blocks until it is present at `dest`.
    async fn retrieve(&self, remote: &str, dest: &Path, peer: &str) -> Result<(), ArtifactError>;
}

/// On-disk artifact format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactEnvelope {
    pub index: String,
    pub round: u64,
    /// Replica name, or `aggregator`.
    pub producer: String,
    pub sample_count: u64,
    pub weights: ModelWeights,
}

impl ArtifactEnvelope {
    pub async fn write(&self, path: &Path) -> Result<(), ArtifactError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| ArtifactError::io(parent, e))?;
        }
        let bytes = serde_json::to_vec(self)?;
        tokio::fs::write(path, bytes).await.map_err(|e| ArtifactError::io(path, e))
    }

    pub async fn read(path: &Path) -> Result<Self, ArtifactError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| ArtifactError::io(path, e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

pub fn aggregate_file_name(index: &str, round: u64) -> String {
    format!("{index}-{round}-agg_update.json")
}

pub fn replica_file_name(index: &str, round: u64, node: &str) -> String {
    format!("{index}-{round}-replica-{node}.json")
}

fn file_name_of(remote: &str) -> &str {
    remote.rsplit('/').next().unwrap_or(remote)
}

/// Writes `envelope` into the staging dir and stores it; returns the remote path.
pub async fn publish_envelope(store: &dyn ArtifactStore, envelope: &ArtifactEnvelope, file_name: &str) -> Result<String, ArtifactError> {
    let local = store.staging_dir().join(file_name);
    envelope.write(&local).await?;
    let remote = store.store(&local).await;
    FL_METRICS.artifacts.transfers_total.add(1, &[]);
    if remote.is_err() {
        FL_METRICS.artifacts.transfer_failures_total.add(1, &[]);
    }
    remote
}

/// Retrieves and decodes a peer's artifact; one retry after `retry_delay`.
pub async fn fetch_envelope(store: &dyn ArtifactStore, remote: &str, peer: &str, retry_delay: Duration) -> Result<ArtifactEnvelope, ArtifactError> {
    let dest = store.staging_dir().join(file_name_of(remote));
    let dest = &dest;
    let res = retry_async(
        move || async move {
            FL_METRICS.artifacts.transfers_total.add(1, &[]);
            let attempt = async {
                store.retrieve(remote, dest, peer).await?;
                ArtifactEnvelope::read(dest).await
            }
            .await;
            if let Err(e) = &attempt {
                FL_METRICS.artifacts.transfer_failures_total.add(1, &[]);
                warn!(%remote, %peer, error = %e, "artifact retrieval failed");
            }
            attempt
        },
        2,
        retry_delay,
    )
    .await;
    if res.is_ok() {
        debug!(%remote, %peer, "artifact retrieved");
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names() {
        assert_eq!(aggregate_file_name("demo", 3), "demo-3-agg_update.json");
        assert_eq!(replica_file_name("demo", 3, "node2"), "demo-3-replica-node2.json");
        assert_eq!(file_name_of("/app/artifacts/aggregator/demo-3-agg_update.json"), "demo-3-agg_update.json");
        assert_eq!(file_name_of("plain.json"), "plain.json");
    }

    #[tokio::test]
    async fn envelope_survives_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("demo-1-agg_update.json");
        let env = ArtifactEnvelope {
            index: "demo".into(),
            round: 1,
            producer: "aggregator".into(),
            sample_count: 0,
            weights: ModelWeights { layers: vec![vec![0.25, -1.0]] },
        };
        env.write(&path).await.unwrap();
        assert_eq!(ArtifactEnvelope::read(&path).await.unwrap(), env);
        assert!(matches!(ArtifactEnvelope::read(&dir.path().join("absent.json")).await, Err(ArtifactError::Io { .. })));
    }
}
