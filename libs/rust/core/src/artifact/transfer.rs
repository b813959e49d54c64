//! Artifact transfer routed through the party's own ledger node: the node is
//! asked to fetch a file from the peer's node (`run client <peer> file get`).
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{ArtifactStore, Workspace};
use crate::error::ArtifactError;
use crate::ledger::http::USER_AGENT;

pub struct LedgerFileTransfer {
    client: reqwest::Client,
    ledger_url: String,
    workspace: Workspace,
    party: String,
    collect_attempts: usize,
    collect_wait: Duration,
}

impl LedgerFileTransfer {
    pub fn new(ledger_url: impl Into<String>, workspace: Workspace, party: impl Into<String>) -> Result<Self, ArtifactError> {
        let client = reqwest::Client::builder().user_agent(USER_AGENT).timeout(Duration::from_secs(60)).build()?;
        Ok(Self {
            client,
            ledger_url: ledger_url.into(),
            workspace,
            party: party.into(),
            collect_attempts: 30,
            collect_wait: Duration::from_secs(1),
        })
    }

    pub fn with_collect_wait(mut self, attempts: usize, wait: Duration) -> Self {
        self.collect_attempts = attempts;
        self.collect_wait = wait;
        self
    }
}

pub(crate) fn file_get_command(peer: &str, remote: &str, dest: &str) -> String {
    format!("run client {peer} file get {remote} {dest}")
}

#[async_trait]
impl ArtifactStore for LedgerFileTransfer {
    fn staging_dir(&self) -> PathBuf { self.workspace.party_dir(&self.party) }

    async fn prepare(&self) -> Result<(), ArtifactError> { self.workspace.prepare(&self.party).await }

    async fn store(&self, local: &Path) -> Result<String, ArtifactError> {
        self.workspace.publish(&self.party, local).await
    }

    async fn retrieve(&self, remote: &str, dest: &Path, peer: &str) -> Result<(), ArtifactError> {
        let file = dest
            .file_name()
            .and_then(|f| f.to_str())
            .ok_or_else(|| ArtifactError::Missing(dest.display().to_string()))?;
        let ledger_dest = self.workspace.ledger_path(&self.party, file);
        let command = file_get_command(peer, remote, &ledger_dest);
        debug!(%command, "requesting artifact");
        let resp = self.client
            .post(&self.ledger_url)
            .header("Content-Type", "text/plain")
            .header("command", command)
            .body(String::new())
            .send()
            .await?;
        let status = resp.status().as_u16();
        if status != 200 {
            return Err(ArtifactError::Status { peer: peer.to_string(), path: remote.to_string(), status });
        }
        self.workspace.collect(&ledger_dest, dest, self.collect_attempts, self.collect_wait).await
    }
}
