//! Where a party's artifacts live: the host filesystem, or a container the
//! ledger node runs in.
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::error::ArtifactError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Workspace {
    /// Ledger node and party share the host filesystem.
    Direct { root: PathBuf },
    /// Ledger node runs inside `container`; files are copied across with `docker cp`.
    Container { container: String, host_root: PathBuf, container_root: String },
}

impl Workspace {
    pub fn direct(root: impl Into<PathBuf>) -> Self { Workspace::Direct { root: root.into() } }

    pub fn host_root(&self) -> &Path {
        match self {
            Workspace::Direct { root } => root,
            Workspace::Container { host_root, .. } => host_root,
        }
    }

    /// Host directory holding `party`'s files.
    pub fn party_dir(&self, party: &str) -> PathBuf { self.host_root().join(party) }

    /// Path of `party/file` as the ledger node sees it.
    pub fn ledger_path(&self, party: &str, file: &str) -> String {
        match self {
            Workspace::Direct { root } => root.join(party).join(file).display().to_string(),
            Workspace::Container { container_root, .. } => format!("{}/{party}/{file}", container_root.trim_end_matches('/')),
        }
    }

    pub async fn prepare(&self, party: &str) -> Result<(), ArtifactError> {
        let dir = self.party_dir(party);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| ArtifactError::io(&dir, e))?;
        if let Workspace::Container { container, container_root, .. } = self {
            let target = format!("{}/{party}", container_root.trim_end_matches('/'));
            docker(&["exec", container.as_str(), "mkdir", "-p", target.as_str()]).await?;
        }
        Ok(())
    }

    /// Makes a host file visible to the ledger node; returns its ledger-side path.
    pub async fn publish(&self, party: &str, local: &Path) -> Result<String, ArtifactError> {
        let file = local
            .file_name()
            .and_then(|f| f.to_str())
            .ok_or_else(|| ArtifactError::Missing(local.display().to_string()))?;
        let target = self.ledger_path(party, file);
        if let Workspace::Container { container, .. } = self {
            let src = local.display().to_string();
            let dst = format!("{container}:{target}");
            docker(&["cp", src.as_str(), dst.as_str()]).await?;
        }
        Ok(target)
    }

    /// Waits for the ledger node to finish writing `ledger_path`, then makes
    /// it available at the host path `dest`.
    pub async fn collect(&self, ledger_path: &str, dest: &Path, attempts: usize, wait: Duration) -> Result<(), ArtifactError> {
        for attempt in 0..attempts.max(1) {
            let present = match self {
                Workspace::Direct { .. } => tokio::fs::try_exists(dest).await.unwrap_or(false),
                Workspace::Container { container, .. } => docker(&["exec", container.as_str(), "test", "-f", ledger_path]).await.is_ok(),
            };
            if present {
                if let Workspace::Container { container, .. } = self {
                    let src = format!("{container}:{ledger_path}");
                    let dst = dest.display().to_string();
                    docker(&["cp", src.as_str(), dst.as_str()]).await?;
                }
                return Ok(());
            }
            debug!(%ledger_path, attempt, "artifact not yet written");
            tokio::time::sleep(wait).await;
        }
        Err(ArtifactError::Missing(ledger_path.to_string()))
    }
}

async fn docker(args: &[&str]) -> Result<(), ArtifactError> {
    let out = Command::new("docker")
        .args(args)
        .output()
        .await
        .map_err(|e| ArtifactError::Container(format!("docker {}: {e}", args.join(" "))))?;
    if !out.status.success() {
        return Err(ArtifactError::Container(format!(
            "docker {} exited with {}: {}",
            args.join(" "),
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_paths() {
        let direct = Workspace::direct("/srv/fl");
        assert_eq!(direct.ledger_path("node1", "demo-1-replica-node1.json"), "/srv/fl/node1/demo-1-replica-node1.json");
        let boxed = Workspace::Container { container: "edgelake".into(), host_root: "/tmp/fl".into(), container_root: "/app/files/".into() };
        assert_eq!(boxed.ledger_path("aggregator", "demo-2-agg_update.json"), "/app/files/aggregator/demo-2-agg_update.json");
        assert_eq!(boxed.party_dir("aggregator"), PathBuf::from("/tmp/fl/aggregator"));
    }

    #[tokio::test]
    async fn direct_publish_and_collect() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::direct(dir.path());
        ws.prepare("node1").await.unwrap();
        let local = ws.party_dir("node1").join("a.json");
        tokio::fs::write(&local, b"{}").await.unwrap();
        let remote = ws.publish("node1", &local).await.unwrap();
        assert_eq!(remote, local.display().to_string());
        ws.collect(&remote, &local, 1, Duration::from_millis(1)).await.unwrap();
        let missing = ws.party_dir("node1").join("b.json");
        let res = ws.collect("b.json", &missing, 2, Duration::from_millis(1)).await;
        assert!(matches!(res, Err(ArtifactError::Missing(_))));
    }
}
