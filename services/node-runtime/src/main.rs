use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use ledgerfl_core::artifact::{ArtifactStore, LedgerFileTransfer};
use ledgerfl_core::federated_learning::{NodeRuntime, StoreFactory};
use ledgerfl_core::ledger::HttpLedger;
use ledgerfl_core::training::TrainingAppRegistry;
use ledgerfl_core::{clear_ready, init_metrics, init_tracing, load_config, mark_ready, start_health_server, ArtifactError};

mod api;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = load_config("node-runtime")?;
    init_tracing(&cfg.service_name)?;
    init_metrics()?;
    start_health_server(&cfg.service_name, cfg.health_port).await?;

    let ledger = Arc::new(HttpLedger::new(&cfg.ledger_url, &cfg.ledger_id)?);
    let ledger_url = cfg.ledger_url.clone();
    let workspace = cfg.workspace();
    let stores: StoreFactory = Arc::new(move |party: &str| -> Result<Arc<dyn ArtifactStore>, ArtifactError> {
        Ok(Arc::new(LedgerFileTransfer::new(ledger_url.clone(), workspace.clone(), party)?) as Arc<dyn ArtifactStore>)
    });
    let mut options = cfg.node_options();
    options.external_address = Some(cfg.advertised_address());
    let runtime = Arc::new(NodeRuntime::new(ledger, cfg.retry_policy(), TrainingAppRegistry::with_builtins(), stores, options));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.listen_port)).await?;
    info!(target: "node-runtime", addr = ?listener.local_addr()?, ledger = %cfg.ledger_url, "node control API listening");
    mark_ready();
    axum::serve(listener, api::router(runtime.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    clear_ready();
    runtime.shutdown().await;
    info!(target: "node-runtime", "node runtime stopped");
    Ok(())
}
