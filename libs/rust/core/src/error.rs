use axum::http::StatusCode;
use ledgerfl_resilience::Interrupted;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger unreachable: {0}")]
    Transport(String),
    #[error("ledger returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed ledger data: {0}")]
    Decode(String),
    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

impl From<reqwest::Error> for LedgerError {
    fn from(e: reqwest::Error) -> Self { LedgerError::Transport(e.to_string()) }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self { LedgerError::Decode(e.to_string()) }
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact io error at {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("transfer of {path} from {peer} failed with status {status}")]
    Status { peer: String, path: String, status: u16 },
    #[error("artifact {0} did not arrive")]
    Missing(String),
    #[error("artifact codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("container command failed: {0}")]
    Container(String),
    #[error("transfer request failed: {0}")]
    Transport(String),
}

impl ArtifactError {
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        ArtifactError::Io { path: path.as_ref().display().to_string(), source }
    }
}

impl From<reqwest::Error> for ArtifactError {
    fn from(e: reqwest::Error) -> Self { ArtifactError::Transport(e.to_string()) }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("index {0} is already registered")]
    AlreadyRegistered(String),
    #[error("index {0} not found in the ledger")]
    NotFound(String),
    /// More than one ledger record claims the same index name; neither can be trusted.
    #[error("index {name} has {count} ledger records")]
    Inconsistent { name: String, count: usize },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("unknown training application {0}")]
    UnknownModule(String),
    #[error("no updates to aggregate")]
    EmptyUpdates,
    #[error("layer shape mismatch: expected {expected}, found {found}")]
    ShapeMismatch { expected: String, found: String },
    #[error("training failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("node {url} rejected registration with status {status}: {body}")]
    Rejected { url: String, status: u16, body: String },
    /// The connection was never established, so the node saw nothing.
    #[error("node {url} unreachable: {message}")]
    Unreachable { url: String, message: String },
    /// The request may have been delivered; the node's reply was lost or late.
    #[error("no reply from node {url}: {message}")]
    Transport { url: String, message: String },
    #[error("node url {0} has no host:port")]
    BadUrl(String),
}

impl RegistrationError {
    /// True when the node certainly did not act on the request.
    pub fn is_definite(&self) -> bool {
        !matches!(self, RegistrationError::Transport { .. })
    }
}

/// Top-level error for coordinator, follower and control calls.
#[derive(Debug, Error)]
pub enum FlError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Training(#[from] TrainingError),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error(transparent)]
    Interrupted(#[from] Interrupted),
    #[error("index {0} not found (not yet initialized)")]
    UnknownIndex(String),
    #[error("training already in progress for index {0}")]
    TrainingInProgress(String),
    #[error("no previous training found for index {0}")]
    NoPreviousTraining(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Fewer distinct nodes reported than the threshold requires.
    #[error("round {round} of {index} has results from {distinct} nodes, {required} required")]
    QuorumNotMet { index: String, round: u64, distinct: usize, required: usize },
}

impl FlError {
    /// The stop flag or deadline that ended the operation, however deeply wrapped.
    pub fn interruption(&self) -> Option<Interrupted> {
        match self {
            FlError::Interrupted(i)
            | FlError::Ledger(LedgerError::Interrupted(i))
            | FlError::Registry(RegistryError::Ledger(LedgerError::Interrupted(i))) => Some(*i),
            _ => None,
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            FlError::UnknownIndex(_) | FlError::Registry(RegistryError::NotFound(_)) => StatusCode::NOT_FOUND,
            FlError::TrainingInProgress(_) | FlError::Registry(RegistryError::AlreadyRegistered(_)) => StatusCode::CONFLICT,
            FlError::InvalidRequest(_) | FlError::NoPreviousTraining(_) | FlError::Training(TrainingError::UnknownModule(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(FlError::UnknownIndex("demo".into()).http_status(), StatusCode::NOT_FOUND);
        assert_eq!(FlError::TrainingInProgress("demo".into()).http_status(), StatusCode::CONFLICT);
        assert_eq!(FlError::InvalidRequest("rounds".into()).http_status(), StatusCode::BAD_REQUEST);
        let inconsistent = FlError::from(RegistryError::Inconsistent { name: "demo".into(), count: 2 });
        assert_eq!(inconsistent.http_status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(inconsistent.to_string().contains("2 ledger records"));
        let stopped = FlError::from(LedgerError::Interrupted(Interrupted::Stopped));
        assert_eq!(stopped.interruption(), Some(Interrupted::Stopped));
        assert_eq!(inconsistent.interruption(), None);
    }
}
