//! Layer-wise fusion over node updates.
use super::{ModelWeights, NodeUpdate};
use crate::error::TrainingError;

fn check_shapes(updates: &[NodeUpdate]) -> Result<&ModelWeights, TrainingError> {
    let first = &updates.first().ok_or(TrainingError::EmptyUpdates)?.weights;
    for u in &updates[1..] {
        if u.weights.shape() != first.shape() {
            return Err(TrainingError::ShapeMismatch {
                expected: format!("{:?}", first.shape()),
                found: format!("{:?} from {}", u.weights.shape(), u.node_id),
            });
        }
    }
    Ok(first)
}

/// Mean of every layer weighted by `sample_count`; plain mean when no
/// update reports samples.
pub fn fed_avg(updates: &[NodeUpdate]) -> Result<ModelWeights, TrainingError> {
    let first = check_shapes(updates)?;
    let total: u64 = updates.iter().map(|u| u.sample_count).sum();
    let weight_of = |u: &NodeUpdate| -> f64 {
        if total == 0 { 1.0 / updates.len() as f64 } else { u.sample_count as f64 / total as f64 }
    };
    let mut acc: Vec<Vec<f64>> = first.layers.iter().map(|l| vec![0.0; l.len()]).collect();
    for u in updates {
        let w = weight_of(u);
        for (acc_layer, layer) in acc.iter_mut().zip(&u.weights.layers) {
            for (a, v) in acc_layer.iter_mut().zip(layer) {
                *a += *v as f64 * w;
            }
        }
    }
    Ok(ModelWeights { layers: acc.into_iter().map(|l| l.into_iter().map(|v| v as f32).collect()).collect() })
}

/// Element-wise maximum of every layer.
pub fn fed_max(updates: &[NodeUpdate]) -> Result<ModelWeights, TrainingError> {
    let mut out = check_shapes(updates)?.clone();
    for u in &updates[1..] {
        for (out_layer, layer) in out.layers.iter_mut().zip(&u.weights.layers) {
            for (o, v) in out_layer.iter_mut().zip(layer) {
                *o = o.max(*v);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upd(node: &str, layers: Vec<Vec<f32>>, samples: u64) -> NodeUpdate {
        NodeUpdate { node_id: node.into(), weights: ModelWeights { layers }, sample_count: samples }
    }

    #[test]
    fn weighted_average() {
        let ups = vec![upd("node1", vec![vec![1.0, 2.0], vec![0.0]], 10), upd("node2", vec![vec![3.0, 4.0], vec![4.0]], 30)];
        let agg = fed_avg(&ups).unwrap();
        assert!((agg.layers[0][0] - 2.5).abs() < 1e-6);
        assert!((agg.layers[0][1] - 3.5).abs() < 1e-6);
        assert!((agg.layers[1][0] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn unweighted_when_no_samples() {
        let ups = vec![upd("node1", vec![vec![1.0]], 0), upd("node2", vec![vec![3.0]], 0)];
        assert!((fed_avg(&ups).unwrap().layers[0][0] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn max_is_elementwise() {
        let ups = vec![upd("node1", vec![vec![1.0, 5.0]], 1), upd("node2", vec![vec![3.0, -4.0]], 1)];
        assert_eq!(fed_max(&ups).unwrap().layers, vec![vec![3.0, 5.0]]);
    }

    #[test]
    fn rejects_empty_and_mismatched() {
        assert!(matches!(fed_avg(&[]), Err(TrainingError::EmptyUpdates)));
        let ups = vec![upd("node1", vec![vec![1.0, 2.0]], 1), upd("node2", vec![vec![1.0]], 1)];
        assert!(matches!(fed_max(&ups), Err(TrainingError::ShapeMismatch { .. })));
    }
}
