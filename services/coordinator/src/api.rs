//! Aggregator control API.
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use ledgerfl_core::federated_learning::{Aggregator, IndexRecord};
use ledgerfl_core::{reply, ApiReply};

type AppState = Arc<Aggregator>;
type Reply = (StatusCode, Json<ApiReply>);

pub fn router(aggregator: AppState) -> Router {
    Router::new()
        .route("/register-index", post(register_index))
        .route("/add-nodes", post(add_nodes))
        .route("/start-training", post(start_training))
        .route("/continue-training", post(continue_training))
        .route("/update-min-participants", post(update_min_participants))
        .route("/stop-training", post(stop_training))
        .route("/status/:index", get(status))
        .route("/indices", get(indices))
        .with_state(aggregator)
}

fn default_module_path() -> String { "builtin".into() }
fn default_min() -> usize { 1 }

#[derive(Debug, Deserialize)]
struct RegisterIndexRequest {
    index: String,
    module_name: String,
    #[serde(default = "default_module_path")]
    module_path: String,
    dataset_handle: String,
}

#[derive(Debug, Deserialize)]
struct AddNodesRequest {
    index: String,
    nodes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct StartTrainingRequest {
    index: String,
    total_rounds: u64,
    #[serde(default = "default_min")]
    min_participants: usize,
}

#[derive(Debug, Deserialize)]
struct ContinueTrainingRequest {
    index: String,
    additional_rounds: u64,
    #[serde(default = "default_min")]
    min_participants: usize,
}

#[derive(Debug, Deserialize)]
struct MinParticipantsRequest {
    index: String,
    min_participants: usize,
}

#[derive(Debug, Deserialize)]
struct IndexRequest {
    index: String,
}

fn bad_body(rejection: JsonRejection) -> Reply {
    let (code, body) = ApiReply::error(StatusCode::BAD_REQUEST, rejection.body_text());
    (code, Json(body))
}

async fn register_index(State(agg): State<AppState>, body: Result<Json<RegisterIndexRequest>, JsonRejection>) -> Reply {
    let Json(req) = match body {
        Ok(b) => b,
        Err(r) => return bad_body(r),
    };
    let record = IndexRecord { name: req.index, module_name: req.module_name, module_path: req.module_path, dataset_handle: req.dataset_handle };
    reply("index registered", agg.register_index(record).await)
}

async fn add_nodes(State(agg): State<AppState>, body: Result<Json<AddNodesRequest>, JsonRejection>) -> Reply {
    let Json(req) = match body {
        Ok(b) => b,
        Err(r) => return bad_body(r),
    };
    reply("nodes processed", agg.add_nodes(&req.index, req.nodes).await)
}

async fn start_training(State(agg): State<AppState>, body: Result<Json<StartTrainingRequest>, JsonRejection>) -> Reply {
    let Json(req) = match body {
        Ok(b) => b,
        Err(r) => return bad_body(r),
    };
    reply("training started", agg.start_training(&req.index, req.total_rounds, req.min_participants).await)
}

async fn continue_training(State(agg): State<AppState>, body: Result<Json<ContinueTrainingRequest>, JsonRejection>) -> Reply {
    let Json(req) = match body {
        Ok(b) => b,
        Err(r) => return bad_body(r),
    };
    reply("training continued", agg.continue_training(&req.index, req.additional_rounds, req.min_participants).await)
}

async fn update_min_participants(State(agg): State<AppState>, body: Result<Json<MinParticipantsRequest>, JsonRejection>) -> Reply {
    let Json(req) = match body {
        Ok(b) => b,
        Err(r) => return bad_body(r),
    };
    let result = agg.update_min_participants(&req.index, req.min_participants).await.map(|q| {
        serde_json::json!({"min_participants": q.requested, "effective_min_participants": q.effective})
    });
    reply("min participants updated", result)
}

async fn stop_training(State(agg): State<AppState>, body: Result<Json<IndexRequest>, JsonRejection>) -> Reply {
    let Json(req) = match body {
        Ok(b) => b,
        Err(r) => return bad_body(r),
    };
    let result = agg.stop_training(&req.index).await.map(|stopped| serde_json::json!({"stopped": stopped}));
    reply("stop requested", result)
}

async fn status(State(agg): State<AppState>, Path(index): Path<String>) -> Reply {
    reply("status", agg.status(&index).await)
}

async fn indices(State(agg): State<AppState>) -> Reply {
    let (code, body) = ApiReply::ok_with("indices", &agg.indices());
    (code, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use ledgerfl_core::artifact::SharedDirStore;
    use ledgerfl_core::federated_learning::{AggregatorOptions, InitNodeRequest, NodeEndpoint, PartyContext};
    use ledgerfl_core::ledger::InMemoryLedger;
    use ledgerfl_core::training::TrainingAppRegistry;
    use ledgerfl_core::{RegistrationError, ReplyStatus, RetryPolicy};
    use serde_json::json;

    struct AcceptAll;

    #[async_trait]
    impl NodeEndpoint for AcceptAll {
        async fn init_node(&self, _url: &str, _req: &InitNodeRequest) -> Result<(), RegistrationError> { Ok(()) }
    }

    async fn serve(dir: &std::path::Path) -> String {
        let ctx = PartyContext {
            ledger: Arc::new(InMemoryLedger::new()),
            store: Arc::new(SharedDirStore::for_party(dir, "aggregator")),
            policy: RetryPolicy::new(Duration::from_millis(5), Duration::from_millis(1), Duration::from_millis(2)),
            address: "aggregator:32048".into(),
            artifact_retry_delay: Duration::from_millis(5),
        };
        let agg = Arc::new(Aggregator::new(ctx, TrainingAppRegistry::with_builtins(), Arc::new(AcceptAll), AggregatorOptions::default()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router(agg)).await.unwrap(); });
        format!("http://{addr}")
    }

    async fn post(client: &reqwest::Client, url: String, body: serde_json::Value) -> (u16, ApiReply) {
        let resp = client.post(url).json(&body).send().await.unwrap();
        (resp.status().as_u16(), resp.json().await.unwrap())
    }

    #[tokio::test]
    async fn register_add_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let base = serve(dir.path()).await;
        let client = reqwest::Client::new();

        let register = json!({"index": "demo", "module_name": "linear-sgd", "dataset_handle": "synthetic"});
        let (code, body) = post(&client, format!("{base}/register-index"), register.clone()).await;
        assert_eq!((code, body.status), (200, ReplyStatus::Success));
        let (code, body) = post(&client, format!("{base}/register-index"), register).await;
        assert_eq!((code, body.status), (409, ReplyStatus::Error));

        let (code, body) = post(&client, format!("{base}/add-nodes"), json!({"index": "demo", "nodes": ["http://10.0.0.2:7848"]})).await;
        assert_eq!(code, 200);
        assert_eq!(body.data.unwrap()["registered"][0]["name"], "node1");

        let status: ApiReply = client.get(format!("{base}/status/demo")).send().await.unwrap().json().await.unwrap();
        assert_eq!(status.data.unwrap()["node_count"], 1);
        let missing = client.get(format!("{base}/status/other")).send().await.unwrap();
        assert_eq!(missing.status().as_u16(), 404);
    }

    #[tokio::test]
    async fn malformed_requests_get_structured_errors() {
        let dir = tempfile::tempdir().unwrap();
        let base = serve(dir.path()).await;
        let client = reqwest::Client::new();

        let (code, body) = post(&client, format!("{base}/start-training"), json!({"index": "demo"})).await;
        assert_eq!((code, body.status), (400, ReplyStatus::Error));
        let (code, body) = post(&client, format!("{base}/register-index"), json!({"index": "demo", "module_name": "keras", "dataset_handle": "db"})).await;
        assert_eq!((code, body.status), (400, ReplyStatus::Error));
        let (code, _) = post(&client, format!("{base}/continue-training"), json!({"index": "nope", "additional_rounds": 2})).await;
        assert_eq!(code, 404);
    }
}
