//! Service configuration: defaults, then an optional file named by
//! `LEDGERFL_CONFIG_FILE`, then `LEDGERFL_*` environment variables.
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use ledgerfl_resilience::RetryPolicy;

use crate::artifact::Workspace;
use crate::federated_learning::{AggregatorOptions, NodeOptions, RegistrationOptions};

pub const ENV_PREFIX: &str = "LEDGERFL";

#[derive(Debug, Clone, Deserialize)]
pub struct FlConfig {
    pub service_name: String,
    /// REST endpoint of this party's ledger node.
    pub ledger_url: String,
    pub ledger_id: String,
    /// host:port peers use to pull this party's artifacts.
    pub external_address: Option<String>,
    pub listen_port: u16,
    pub health_port: u16,
    pub artifact_dir: PathBuf,
    pub container_name: Option<String>,
    pub container_artifact_dir: Option<String>,
    pub poll_interval_ms: u64,
    pub retry_jitter_low_ms: u64,
    pub retry_jitter_high_ms: u64,
    /// 0 leaves rounds unbounded.
    pub round_deadline_secs: u64,
    pub registration_timeout_secs: u64,
    pub registration_stagger_ms: u64,
    pub listener_join_timeout_ms: u64,
    pub artifact_retry_delay_ms: u64,
}

impl FlConfig {
    /// Poll cadence and jitter shared by coordinator and follower loops.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.poll_interval_ms),
            Duration::from_millis(self.retry_jitter_low_ms),
            Duration::from_millis(self.retry_jitter_high_ms),
        )
    }

    pub fn round_deadline(&self) -> Option<Duration> {
        (self.round_deadline_secs > 0).then(|| Duration::from_secs(self.round_deadline_secs))
    }

    pub fn workspace(&self) -> Workspace {
        match &self.container_name {
            Some(container) => Workspace::Container {
                container: container.clone(),
                host_root: self.artifact_dir.clone(),
                container_root: self.container_artifact_dir.clone().unwrap_or_else(|| "/app/artifacts".into()),
            },
            None => Workspace::direct(&self.artifact_dir),
        }
    }

    pub fn aggregator_options(&self) -> AggregatorOptions {
        AggregatorOptions {
            registration: RegistrationOptions {
                stagger: Duration::from_millis(self.registration_stagger_ms),
                timeout: Duration::from_secs(self.registration_timeout_secs),
            },
            round_deadline: self.round_deadline(),
            join_timeout: Duration::from_millis(self.listener_join_timeout_ms),
        }
    }

    pub fn node_options(&self) -> NodeOptions {
        NodeOptions {
            external_address: self.external_address.clone(),
            artifact_retry_delay: Duration::from_millis(self.artifact_retry_delay_ms),
            join_timeout: Duration::from_millis(self.listener_join_timeout_ms),
        }
    }

    /// Address advertised to peers, falling back to the ledger node's host:port.
    pub fn advertised_address(&self) -> String {
        if let Some(addr) = &self.external_address {
            return addr.clone();
        }
        reqwest::Url::parse(&self.ledger_url)
            .ok()
            .and_then(|u| Some(format!("{}:{}", u.host_str()?, u.port_or_known_default()?)))
            .unwrap_or_else(|| self.ledger_url.clone())
    }
}

fn build(service: &str, file: Option<String>, env: Environment) -> Result<FlConfig> {
    let mut builder = Config::builder()
        .set_default("service_name", service)?
        .set_default("ledger_url", "http://127.0.0.1:32049")?
        .set_default("ledger_id", "master")?
        .set_default("listen_port", 8080)?
        .set_default("health_port", 9100)?
        .set_default("artifact_dir", "./artifacts")?
        .set_default("poll_interval_ms", 2000)?
        .set_default("retry_jitter_low_ms", 2000)?
        .set_default("retry_jitter_high_ms", 5000)?
        .set_default("round_deadline_secs", 0)?
        .set_default("registration_timeout_secs", 180)?
        .set_default("registration_stagger_ms", 100)?
        .set_default("listener_join_timeout_ms", 1000)?
        .set_default("artifact_retry_delay_ms", 1000)?;
    if let Some(file) = file {
        builder = builder.add_source(File::with_name(&file).required(false));
    }
    let cfg: FlConfig = builder.add_source(env).build()?.try_deserialize()?;
    ensure!(cfg.retry_jitter_low_ms <= cfg.retry_jitter_high_ms, "retry jitter range is inverted");
    ensure!(cfg.poll_interval_ms > 0, "poll interval must be positive");
    Ok(cfg)
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX).prefix_separator("_").separator("__").try_parsing(true)
}

pub fn load_config(service: &str) -> Result<FlConfig> {
    build(service, std::env::var(format!("{ENV_PREFIX}_CONFIG_FILE")).ok(), environment())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> Environment {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        environment().source(Some(map))
    }

    #[test]
    fn defaults_apply() {
        let cfg = build("aggregator", None, env(&[])).unwrap();
        assert_eq!(cfg.service_name, "aggregator");
        assert_eq!(cfg.ledger_id, "master");
        assert_eq!(cfg.retry_policy().poll_interval, Duration::from_secs(2));
        assert_eq!(cfg.round_deadline(), None);
        assert_eq!(cfg.workspace(), Workspace::direct("./artifacts"));
        assert_eq!(cfg.advertised_address(), "127.0.0.1:32049");
    }

    #[test]
    fn environment_overrides() {
        let cfg = build("node", None, env(&[
            ("LEDGERFL_POLL_INTERVAL_MS", "250"),
            ("LEDGERFL_ROUND_DEADLINE_SECS", "30"),
            ("LEDGERFL_CONTAINER_NAME", "anylog-node"),
            ("LEDGERFL_EXTERNAL_ADDRESS", "10.0.0.9:32048"),
        ]))
        .unwrap();
        assert_eq!(cfg.poll_interval_ms, 250);
        assert_eq!(cfg.round_deadline(), Some(Duration::from_secs(30)));
        assert!(matches!(cfg.workspace(), Workspace::Container { ref container, .. } if container == "anylog-node"));
        assert_eq!(cfg.advertised_address(), "10.0.0.9:32048");
    }

    #[test]
    fn file_layer_sits_under_environment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledgerfl.json");
        std::fs::write(&path, r#"{"ledger_id": "fl-test", "health_port": 9300}"#).unwrap();
        let cfg = build("node", Some(path.display().to_string()), env(&[("LEDGERFL_HEALTH_PORT", "9400")])).unwrap();
        assert_eq!(cfg.ledger_id, "fl-test");
        assert_eq!(cfg.health_port, 9400);
    }

    #[test]
    fn inverted_jitter_is_rejected() {
        assert!(build("node", None, env(&[("LEDGERFL_RETRY_JITTER_LOW_MS", "9000")])).is_err());
    }
}
