//! Node control API.
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};

use ledgerfl_core::federated_learning::{InitNodeRequest, NodeRuntime};
use ledgerfl_core::{reply, ApiReply};

type AppState = Arc<NodeRuntime>;

pub fn router(runtime: AppState) -> Router {
    Router::new()
        .route("/init-node", post(init_node))
        .route("/status", get(status))
        .with_state(runtime)
}

async fn init_node(State(rt): State<AppState>, body: Result<Json<InitNodeRequest>, JsonRejection>) -> (StatusCode, Json<ApiReply>) {
    let Json(req) = match body {
        Ok(b) => b,
        Err(r) => {
            let (code, body) = ApiReply::error(StatusCode::BAD_REQUEST, r.body_text());
            return (code, Json(body));
        }
    };
    let index = req.replica_index.clone();
    reply(&format!("following index {index}"), rt.init_node(req).await)
}

async fn status(State(rt): State<AppState>) -> (StatusCode, Json<ApiReply>) {
    let (code, body) = ApiReply::ok_with("status", &rt.status());
    (code, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use ledgerfl_core::artifact::{ArtifactStore, SharedDirStore};
    use ledgerfl_core::federated_learning::{NodeOptions, StoreFactory};
    use ledgerfl_core::ledger::InMemoryLedger;
    use ledgerfl_core::training::TrainingAppRegistry;
    use ledgerfl_core::{ReplyStatus, RetryPolicy};
    use serde_json::json;

    #[tokio::test]
    async fn init_then_status() {
        let dir = tempfile::tempdir().unwrap();
        let shared = dir.path().to_path_buf();
        let factory: StoreFactory = Arc::new(move |party: &str| Ok(Arc::new(SharedDirStore::for_party(&shared, party)) as Arc<dyn ArtifactStore>));
        let policy = RetryPolicy::new(Duration::from_millis(5), Duration::from_millis(1), Duration::from_millis(2));
        let rt = Arc::new(NodeRuntime::new(Arc::new(InMemoryLedger::new()), policy, TrainingAppRegistry::with_builtins(), factory, NodeOptions::default()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router(rt)).await.unwrap(); });
        let client = reqwest::Client::new();

        let req = json!({
            "replica_name": "node1", "replica_ip": "127.0.0.1", "replica_port": 7848, "replica_index": "demo",
            "round_number": 1, "module_name": "linear-sgd", "module_path": "builtin", "dataset_handle": "synthetic"
        });
        let resp = client.post(format!("http://{addr}/init-node")).json(&req).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 200);

        let bad = client.post(format!("http://{addr}/init-node")).json(&json!({"replica_name": "node1"})).send().await.unwrap();
        assert_eq!(bad.status().as_u16(), 400);
        let bad: ApiReply = bad.json().await.unwrap();
        assert_eq!(bad.status, ReplyStatus::Error);

        let status: ApiReply = client.get(format!("http://{addr}/status")).send().await.unwrap().json().await.unwrap();
        assert_eq!(status.data.unwrap()[0]["index"], "demo");
    }
}
