use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;

use crate::{CheckpointKey, EnsembleConfig, EnsembleResult, ModelWeights, PredictionShape};

/// A trainable predictor emitting a Gaussian per feature set.
pub trait ProbabilisticModel: Send {
    /// Predictive distribution for every row of `inputs` (one matrix per feature set).
    fn predict(&self, inputs: &[DMatrix<f64>]) -> EnsembleResult<PredictionShape>;

    /// One pass over the training data in shuffled mini-batches.
    /// Returns the mean training NLL observed during the pass.
    fn fit_epoch(
        &mut self,
        inputs: &[DMatrix<f64>],
        target: &DVector<f64>,
        batch_size: usize,
        rng: &mut StdRng,
    ) -> EnsembleResult<f64>;

    /// Mean NLL of `target` under the model's current predictions, summed over
    /// feature-set heads.
    fn negative_log_likelihood(
        &self,
        inputs: &[DMatrix<f64>],
        target: &DVector<f64>,
    ) -> EnsembleResult<f64>;

    fn weights(&self) -> ModelWeights;

    fn set_weights(&mut self, weights: &ModelWeights) -> EnsembleResult<()>;
}

/// Builds fresh, untrained members.
pub trait ModelFactory: Send + Sync {
    fn build_model(
        &self,
        config: &EnsembleConfig,
        input_dims: &[usize],
        seed: u64,
    ) -> EnsembleResult<Box<dyn ProbabilisticModel>>;
}

/// Persistence for member weights, keyed by (fold, member).
pub trait ModelStore: Send + Sync {
    fn put(&self, key: CheckpointKey, weights: &ModelWeights) -> EnsembleResult<()>;

    fn get(&self, key: CheckpointKey) -> EnsembleResult<ModelWeights>;
}
