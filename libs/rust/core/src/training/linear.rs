//! Reference application: linear regression trained by full-batch gradient
//! descent on seeded synthetic data.
//!
//! Each replica draws its own sample of the same underlying line, so the
//! fused model converges towards the shared coefficients. The dataset handle
//! selects the problem size as `name[:dim[:samples]]`.
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use super::{fed_avg, AppContext, LocalUpdate, ModelWeights, NodeUpdate, TrainingApplication};
use crate::error::TrainingError;

pub const LINEAR_SGD: &str = "linear-sgd";

const DEFAULT_DIM: usize = 3;
const DEFAULT_SAMPLES: usize = 64;
const LEARNING_RATE: f32 = 0.1;
const EPOCHS: usize = 5;

pub struct LinearSgdApp {
    weights: Vec<f32>,
    bias: f32,
    samples: Vec<(Vec<f32>, f32)>,
}

fn parse_handle(handle: &str) -> Result<(usize, usize), TrainingError> {
    let mut parts = handle.split(':').skip(1);
    let mut field = |default: usize, what: &str| -> Result<usize, TrainingError> {
        match parts.next() {
            None | Some("") => Ok(default),
            Some(v) => v.parse().map_err(|_| TrainingError::Failed(format!("dataset handle {handle:?}: bad {what} {v:?}"))),
        }
    };
    let dim = field(DEFAULT_DIM, "dim")?;
    let samples = field(DEFAULT_SAMPLES, "samples")?;
    if dim == 0 {
        return Err(TrainingError::Failed(format!("dataset handle {handle:?}: dim must be positive")));
    }
    Ok((dim, samples))
}

fn seed_for(ctx: &AppContext) -> u64 {
    let mut h = Sha256::new();
    h.update(ctx.index.as_bytes());
    h.update(ctx.replica.as_deref().unwrap_or("aggregator").as_bytes());
    h.update(ctx.dataset_handle.as_bytes());
    let digest = h.finalize();
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(seed)
}

impl LinearSgdApp {
    pub fn from_context(ctx: &AppContext) -> Result<Self, TrainingError> {
        let (dim, n) = parse_handle(&ctx.dataset_handle)?;
        let samples = if ctx.replica.is_some() { synthetic(dim, n, seed_for(ctx)) } else { Vec::new() };
        Ok(Self { weights: vec![0.0; dim], bias: 0.0, samples })
    }

    pub fn mse(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let total: f32 = self.samples.iter().map(|(x, y)| (self.predict(x) - y).powi(2)).sum();
        total / self.samples.len() as f32
    }

    fn predict(&self, x: &[f32]) -> f32 {
        self.weights.iter().zip(x).map(|(w, v)| w * v).sum::<f32>() + self.bias
    }
}

/// `y = sum(0.5 * (j + 1) * x_j) + 1 + noise`, identical across replicas.
fn synthetic(dim: usize, n: usize, seed: u64) -> Vec<(Vec<f32>, f32)> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let x: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let y = x.iter().enumerate().map(|(j, v)| 0.5 * (j + 1) as f32 * v).sum::<f32>() + 1.0 + rng.gen_range(-0.05..0.05);
            (x, y)
        })
        .collect()
}

#[async_trait]
impl TrainingApplication for LinearSgdApp {
    fn get_weights(&self) -> ModelWeights {
        ModelWeights { layers: vec![self.weights.clone(), vec![self.bias]] }
    }

    fn update_model(&mut self, weights: ModelWeights) -> Result<(), TrainingError> {
        let expected = self.get_weights().shape();
        if weights.shape() != expected {
            return Err(TrainingError::ShapeMismatch { expected: format!("{expected:?}"), found: format!("{:?}", weights.shape()) });
        }
        let mut layers = weights.layers.into_iter();
        self.weights = layers.next().unwrap_or_default();
        self.bias = layers.next().and_then(|b| b.first().copied()).unwrap_or_default();
        Ok(())
    }

    async fn train(&mut self, round: u64) -> Result<LocalUpdate, TrainingError> {
        if self.samples.is_empty() {
            return Err(TrainingError::Failed("no local samples".into()));
        }
        let n = self.samples.len() as f32;
        for _ in 0..EPOCHS {
            let mut grad_w = vec![0.0f32; self.weights.len()];
            let mut grad_b = 0.0f32;
            for (x, y) in &self.samples {
                let err = self.predict(x) - y;
                for (g, v) in grad_w.iter_mut().zip(x) {
                    *g += err * v;
                }
                grad_b += err;
            }
            for (w, g) in self.weights.iter_mut().zip(&grad_w) {
                *w -= LEARNING_RATE * 2.0 * g / n;
            }
            self.bias -= LEARNING_RATE * 2.0 * grad_b / n;
        }
        tracing::debug!(round, mse = self.mse(), "local epochs finished");
        Ok(LocalUpdate { weights: self.get_weights(), sample_count: self.samples.len() as u64 })
    }

    fn aggregate(&self, updates: &[NodeUpdate]) -> Result<ModelWeights, TrainingError> {
        fed_avg(updates)
    }
}
