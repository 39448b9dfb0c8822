use ensemble_core::{CheckpointKey, EnsembleError, EnsembleResult, ProbabilisticModel};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;

use crate::folds::FoldData;
use crate::pipeline::EnsemblePipeline;

/// Separates the batch-shuffling stream from the initialisation stream.
const SHUFFLE_STREAM: u64 = 0x9e37_79b9_7f4a_7c15;

/// Best-epoch statistics of one trained member.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrainingReport {
    pub member: usize,
    /// 1-based epoch whose weights were kept.
    pub best_epoch: usize,
    pub train_nll: f64,
    pub val_nll: f64,
}

impl EnsemblePipeline<'_> {
    /// Train member `key.member` on one fold, checkpointing only when the
    /// validation NLL improves, and return the model restored to its best epoch.
    pub fn train_member(
        &self,
        key: CheckpointKey,
        data: &FoldData,
    ) -> EnsembleResult<(Box<dyn ProbabilisticModel>, TrainingReport)> {
        let mut model = self.build_member(key, &data.input_dims())?;
        let mut rng = StdRng::seed_from_u64(self.member_seed(key) ^ SHUFFLE_STREAM);
        let mut best: Option<TrainingReport> = None;

        for epoch in 1..=self.config.epochs {
            let train_nll = model
                .fit_epoch(&data.x_train, &data.y_train, self.config.batch_size, &mut rng)
                .map_err(|e| e.in_member(key.fold, key.member))?;
            let val_nll = model
                .negative_log_likelihood(&data.x_val, &data.y_val)
                .map_err(|e| e.in_member(key.fold, key.member))?;

            if !train_nll.is_finite() || !val_nll.is_finite() {
                return Err(EnsembleError::numerical(
                    key.fold,
                    Some(key.member),
                    format!("epoch {epoch}: train NLL {train_nll}, validation NLL {val_nll}"),
                ));
            }

            tracing::debug!(
                "fold {} member {} epoch {}: train NLL {:.4}, val NLL {:.4}",
                key.fold,
                key.member,
                epoch,
                train_nll,
                val_nll
            );

            if best.map_or(true, |b| val_nll < b.val_nll) {
                self.store.put(key, &model.weights())?;
                best = Some(TrainingReport {
                    member: key.member,
                    best_epoch: epoch,
                    train_nll,
                    val_nll,
                });
            }
        }

        let report = best.ok_or_else(|| {
            EnsembleError::Configuration("epochs must be > 0 to train a member".into())
        })?;

        let weights = self.store.get(key)?;
        model
            .set_weights(&weights)
            .map_err(|e| EnsembleError::checkpoint(key, e.to_string()))?;

        tracing::info!(
            "Model id: {}, best epoch: {}, train NLL: {:.3}, val NLL: {:.3}",
            key.member,
            report.best_epoch,
            report.train_nll,
            report.val_nll
        );

        Ok((model, report))
    }
}
