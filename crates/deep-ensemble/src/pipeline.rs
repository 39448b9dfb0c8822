use ensemble_core::{
    CheckpointKey, EnsembleConfig, EnsembleError, EnsembleResult, ModelFactory, ModelStore,
    ProbabilisticModel,
};

/// Configuration plus the two external collaborators every stage needs.
///
/// Training, aggregation, cross-validation and prediction collection are
/// implemented as `impl` blocks in their own modules.
#[derive(Clone, Copy)]
pub struct EnsemblePipeline<'a> {
    pub(crate) config: &'a EnsembleConfig,
    pub(crate) factory: &'a dyn ModelFactory,
    pub(crate) store: &'a dyn ModelStore,
}

impl<'a> EnsemblePipeline<'a> {
    pub fn new(
        config: &'a EnsembleConfig,
        factory: &'a dyn ModelFactory,
        store: &'a dyn ModelStore,
    ) -> Self {
        Self {
            config,
            factory,
            store,
        }
    }

    pub fn config(&self) -> &EnsembleConfig {
        self.config
    }

    /// Deterministic per-member seed so members differ but reruns agree.
    pub fn member_seed(&self, key: CheckpointKey) -> u64 {
        self.config
            .seed
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(((key.fold as u64) << 32) | key.member as u64)
    }

    pub(crate) fn build_member(
        &self,
        key: CheckpointKey,
        input_dims: &[usize],
    ) -> EnsembleResult<Box<dyn ProbabilisticModel>> {
        self.factory
            .build_model(self.config, input_dims, self.member_seed(key))
    }

    /// Build a fresh member and restore its persisted weights.
    pub fn load_member(
        &self,
        key: CheckpointKey,
        input_dims: &[usize],
    ) -> EnsembleResult<Box<dyn ProbabilisticModel>> {
        let weights = self.store.get(key)?;
        let mut model = self.build_member(key, input_dims)?;
        model
            .set_weights(&weights)
            .map_err(|e| EnsembleError::checkpoint(key, e.to_string()))?;
        Ok(model)
    }
}
