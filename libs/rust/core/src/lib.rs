//! Core of the ledger-coordinated federated-learning services.
//!
//! Parties never talk to each other directly: the aggregator announces rounds
//! and nodes publish results as ledger records, and model weights travel as
//! artifacts. This crate holds the protocol plus the tracing, metrics, health
//! and configuration plumbing the services share.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::{routing::get, Json, Router};
use once_cell::sync::OnceCell;
use opentelemetry::global;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Encoder, TextEncoder};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

pub mod artifact;
pub mod config;
pub mod control;
pub mod error;
pub mod federated_learning;
pub mod ledger;
pub mod lifecycle;
pub mod metrics_ext;
pub mod registry;
pub mod training;

pub use config::{load_config, FlConfig};
pub use control::{reply, ApiReply, ReplyStatus};
pub use error::{ArtifactError, FlError, LedgerError, RegistrationError, RegistryError, TrainingError};
pub use federated_learning::{Aggregator, NodeRuntime, PartyContext};
pub use ledgerfl_resilience::{CancelScope, Interrupted, Quorum, RetryPolicy, StopFlag};
pub use lifecycle::{FollowerPhase, RoundPhase, RoundTracker};
pub use metrics_ext::{FlMetrics, FL_METRICS};

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static METRICS_INIT: OnceCell<()> = OnceCell::new();
static SERVICE_LIVENESS: AtomicBool = AtomicBool::new(true);
static SERVICE_READINESS: AtomicBool = AtomicBool::new(false);

pub fn mark_ready() { SERVICE_READINESS.store(true, Ordering::SeqCst); }
pub fn clear_ready() { SERVICE_READINESS.store(false, Ordering::SeqCst); }
pub fn mark_not_live() { SERVICE_LIVENESS.store(false, Ordering::SeqCst); }

/// Installs the global subscriber once. `LEDGERFL_JSON_LOG=1|true` switches
/// to JSON lines; filtering follows `RUST_LOG` (default `info`).
pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("LEDGERFL_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let (json_layer, text_layer) = if json {
            (Some(tracing_subscriber::fmt::layer().json().flatten_event(true).with_current_span(true).with_span_list(false)), None)
        } else {
            (None, Some(tracing_subscriber::fmt::layer().with_target(true).with_thread_ids(false).with_line_number(true)))
        };
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry().with(env_filter).with(json_layer).with(text_layer).try_init()?;
        Ok(())
    })?;
    info!(target: "ledgerfl", service, "tracing initialized");
    Ok(())
}

/// Routes the global OpenTelemetry meter into the default prometheus registry.
pub fn init_metrics() -> Result<()> {
    METRICS_INIT.get_or_try_init(|| -> Result<()> {
        let exporter = opentelemetry_prometheus::exporter().with_registry(prometheus::default_registry().clone()).build()?;
        let provider = SdkMeterProvider::builder().with_reader(exporter).build();
        global::set_meter_provider(provider);
        Ok(())
    })?;
    Ok(())
}

pub fn health_router(service: &str) -> Router {
    let service = service.to_string();
    Router::new()
        .route("/live", get(|| async { Json(serde_json::json!({"live": SERVICE_LIVENESS.load(Ordering::SeqCst)})) }))
        .route("/ready", get(|| async { Json(serde_json::json!({"ready": SERVICE_READINESS.load(Ordering::SeqCst)})) }))
        .route("/status", get(move || async move {
            Json(serde_json::json!({
                "service": service,
                "live": SERVICE_LIVENESS.load(Ordering::SeqCst),
                "ready": SERVICE_READINESS.load(Ordering::SeqCst),
            }))
        }))
        .route("/metrics", get(metrics_handler))
}

/// Binds the health listener and serves it in the background.
pub async fn start_health_server(service: &str, port: u16) -> Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    let addr = listener.local_addr()?;
    let app = health_router(service);
    info!(?addr, "health server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = ?e, "health server failed");
        }
    });
    Ok(addr)
}

async fn metrics_handler() -> impl IntoResponse {
    if METRICS_INIT.get().is_none() {
        return (StatusCode::SERVICE_UNAVAILABLE, [(header::CONTENT_TYPE, "text/plain")], b"metrics not initialized".to_vec());
    }
    let families = prometheus::default_registry().gather();
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&families, &mut buf) {
        return (StatusCode::INTERNAL_SERVER_ERROR, [(header::CONTENT_TYPE, "text/plain")], format!("encode error: {e}").into_bytes());
    }
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4")], buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_endpoints_report_flags() {
        init_metrics().unwrap();
        FL_METRICS.rounds.rounds_started_total.add(1, &[]);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, health_router("test")).await.unwrap(); });

        mark_ready();
        let ready: serde_json::Value = reqwest::get(format!("http://{addr}/ready")).await.unwrap().json().await.unwrap();
        assert_eq!(ready["ready"], true);
        let status: serde_json::Value = reqwest::get(format!("http://{addr}/status")).await.unwrap().json().await.unwrap();
        assert_eq!(status["service"], "test");
        let metrics = reqwest::get(format!("http://{addr}/metrics")).await.unwrap();
        assert_eq!(metrics.status(), 200);
    }
}
