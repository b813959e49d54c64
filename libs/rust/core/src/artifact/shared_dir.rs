//! Artifact store over a directory every party can read, for single-host
//! deployments and tests.
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::ArtifactStore;
use crate::error::ArtifactError;

#[derive(Debug, Clone)]
pub struct SharedDirStore {
    published: PathBuf,
    staging: PathBuf,
}

impl SharedDirStore {
    /// Store for `party` rooted at `shared`; published files land in `shared/published`.
    pub fn for_party(shared: impl AsRef<Path>, party: &str) -> Self {
        let shared = shared.as_ref();
        Self { published: shared.join("published"), staging: shared.join("staging").join(party) }
    }
}

#[async_trait]
impl ArtifactStore for SharedDirStore {
    fn staging_dir(&self) -> PathBuf { self.staging.clone() }

    async fn store(&self, local: &Path) -> Result<String, ArtifactError> {
        let file = local.file_name().ok_or_else(|| ArtifactError::Missing(local.display().to_string()))?;
        tokio::fs::create_dir_all(&self.published).await.map_err(|e| ArtifactError::io(&self.published, e))?;
        let target = self.published.join(file);
        tokio::fs::copy(local, &target).await.map_err(|e| ArtifactError::io(local, e))?;
        Ok(target.display().to_string())
    }

    async fn retrieve(&self, remote: &str, dest: &Path, _peer: &str) -> Result<(), ArtifactError> {
        if !tokio::fs::try_exists(remote).await.unwrap_or(false) {
            return Err(ArtifactError::Missing(remote.to_string()));
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| ArtifactError::io(parent, e))?;
        }
        tokio::fs::copy(remote, dest).await.map_err(|e| ArtifactError::io(remote, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_then_retrieve_across_parties() {
        let dir = tempfile::tempdir().unwrap();
        let agg = SharedDirStore::for_party(dir.path(), "aggregator");
        let node = SharedDirStore::for_party(dir.path(), "node1");
        tokio::fs::create_dir_all(agg.staging_dir()).await.unwrap();
        let local = agg.staging_dir().join("demo-1-agg_update.json");
        tokio::fs::write(&local, b"[1,2]").await.unwrap();
        let remote = agg.store(&local).await.unwrap();

        let dest = node.staging_dir().join("demo-1-agg_update.json");
        node.retrieve(&remote, &dest, "aggregator").await.unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"[1,2]");
        assert!(matches!(node.retrieve("/nowhere/x.json", &dest, "aggregator").await, Err(ArtifactError::Missing(_))));
    }
}
