use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use ledgerfl_core::artifact::{ArtifactStore, LedgerFileTransfer};
use ledgerfl_core::federated_learning::{Aggregator, HttpNodeEndpoint, PartyContext};
use ledgerfl_core::ledger::HttpLedger;
use ledgerfl_core::training::TrainingAppRegistry;
use ledgerfl_core::{clear_ready, init_metrics, init_tracing, load_config, mark_ready, start_health_server};

mod api;

const PARTY: &str = "aggregator";

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = load_config("aggregator")?;
    init_tracing(&cfg.service_name)?;
    init_metrics()?;
    start_health_server(&cfg.service_name, cfg.health_port).await?;

    let ledger = Arc::new(HttpLedger::new(&cfg.ledger_url, &cfg.ledger_id)?);
    let store = Arc::new(LedgerFileTransfer::new(&cfg.ledger_url, cfg.workspace(), PARTY)?);
    store.prepare().await?;
    let ctx = PartyContext {
        ledger,
        store,
        policy: cfg.retry_policy(),
        address: cfg.advertised_address(),
        artifact_retry_delay: Duration::from_millis(cfg.artifact_retry_delay_ms),
    };
    let endpoint = Arc::new(HttpNodeEndpoint::new(Duration::from_secs(cfg.registration_timeout_secs))?);
    let aggregator = Arc::new(Aggregator::new(ctx, TrainingAppRegistry::with_builtins(), endpoint, cfg.aggregator_options()));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.listen_port)).await?;
    info!(target: "aggregator", addr = ?listener.local_addr()?, ledger = %cfg.ledger_url, "aggregator control API listening");
    mark_ready();
    axum::serve(listener, api::router(aggregator.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    clear_ready();
    aggregator.shutdown().await;
    info!(target: "aggregator", "aggregator stopped");
    Ok(())
}
