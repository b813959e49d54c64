//! Training Application capability interface.
//!
//! The round protocol never looks inside a model. It moves [`ModelWeights`]
//! between parties and asks the application to load, train and fuse them.
//! Applications are chosen per index through [`TrainingAppRegistry`] by a
//! stable identifier (the index's `module_name`).

pub mod fusion;
pub mod linear;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TrainingError;

pub use fusion::{fed_avg, fed_max};
pub use linear::LinearSgdApp;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelWeights {
    pub layers: Vec<Vec<f32>>,
}

impl ModelWeights {
    pub fn shape(&self) -> Vec<usize> { self.layers.iter().map(Vec::len).collect() }
}

/// Result of one local training pass.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalUpdate {
    pub weights: ModelWeights,
    pub sample_count: u64,
}

/// One node's contribution to a round, as handed to fusion.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeUpdate {
    pub node_id: String,
    pub weights: ModelWeights,
    pub sample_count: u64,
}

#[async_trait]
pub trait TrainingApplication: Send + Sync {
    fn get_weights(&self) -> ModelWeights;
    fn update_model(&mut self, weights: ModelWeights) -> Result<(), TrainingError>;
    async fn train(&mut self, round: u64) -> Result<LocalUpdate, TrainingError>;
    fn aggregate(&self, updates: &[NodeUpdate]) -> Result<ModelWeights, TrainingError>;
}

/// What a factory knows about the party it builds an application for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppContext {
    pub index: String,
    /// `None` on the aggregator.
    pub replica: Option<String>,
    pub dataset_handle: String,
}

pub type AppFactory = Arc<dyn Fn(&AppContext) -> Result<Box<dyn TrainingApplication>, TrainingError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct TrainingAppRegistry {
    factories: HashMap<String, AppFactory>,
}

impl TrainingAppRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register(linear::LINEAR_SGD, Arc::new(|ctx: &AppContext| {
            Ok(Box::new(LinearSgdApp::from_context(ctx)?) as Box<dyn TrainingApplication>)
        }));
        reg
    }

    pub fn register(&mut self, module_name: impl Into<String>, factory: AppFactory) {
        self.factories.insert(module_name.into(), factory);
    }

    pub fn contains(&self, module_name: &str) -> bool { self.factories.contains_key(module_name) }

    pub fn create(&self, module_name: &str, ctx: &AppContext) -> Result<Box<dyn TrainingApplication>, TrainingError> {
        let factory = self.factories.get(module_name).ok_or_else(|| TrainingError::UnknownModule(module_name.to_string()))?;
        factory(ctx)
    }
}

/// Orders updates by node id so fusion input is reproducible.
pub fn canonical_order(mut updates: Vec<NodeUpdate>) -> Vec<NodeUpdate> {
    updates.sort_by(|a, b| a.node_id.cmp(&b.node_id));
    updates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_creates_builtin_and_rejects_unknown() {
        let reg = TrainingAppRegistry::with_builtins();
        let ctx = AppContext { index: "demo".into(), replica: Some("node1".into()), dataset_handle: "synthetic".into() };
        assert!(reg.contains("linear-sgd"));
        assert!(reg.create("linear-sgd", &ctx).is_ok());
        assert!(matches!(reg.create("torch-cnn", &ctx), Err(TrainingError::UnknownModule(_))));
    }

    #[test]
    fn canonical_order_sorts_by_node() {
        let w = ModelWeights::default();
        let ups = vec![
            NodeUpdate { node_id: "node2".into(), weights: w.clone(), sample_count: 1 },
            NodeUpdate { node_id: "node1".into(), weights: w, sample_count: 1 },
        ];
        let ids: Vec<_> = canonical_order(ups).into_iter().map(|u| u.node_id).collect();
        assert_eq!(ids, vec!["node1", "node2"]);
    }
}
