use ensemble_core::{Dataset, EnsembleError, EnsembleResult};
use serde::Serialize;

use crate::aggregator::{MemberSummary, Mode};
use crate::folds::{plan_folds, FoldData};
use crate::metrics::MeanStd;
use crate::pipeline::EnsemblePipeline;

/// Metrics from a single fold.
#[derive(Debug, Clone, Serialize)]
pub struct FoldResult {
    pub fold: usize,
    pub rmse: f64,
    pub nll: Vec<f64>,
    pub members: Vec<MemberSummary>,
}

/// Fold metrics aggregated across the whole run.
#[derive(Debug, Clone, Serialize)]
pub struct CrossValidationSummary {
    pub folds: Vec<FoldResult>,
    pub rmse: MeanStd,
    /// One entry per feature set.
    pub nll: Vec<MeanStd>,
}

impl CrossValidationSummary {
    fn from_folds(folds: Vec<FoldResult>, n_sets: usize) -> Self {
        let rmses: Vec<f64> = folds.iter().map(|f| f.rmse).collect();
        let nll = (0..n_sets)
            .map(|i| {
                let values: Vec<f64> = folds.iter().map(|f| f.nll[i]).collect();
                MeanStd::of(&values)
            })
            .collect();
        Self {
            rmse: MeanStd::of(&rmses),
            nll,
            folds,
        }
    }
}

impl EnsemblePipeline<'_> {
    /// Run every fold in `mode` and summarise RMSE and per-feature-set NLL.
    ///
    /// Any fold failure aborts the run.
    pub fn run_cross_validation(
        &self,
        dataset: &Dataset,
        mode: Mode,
    ) -> EnsembleResult<CrossValidationSummary> {
        self.config.validate()?;
        let n_sets = self.config.resolve_feature_sets(dataset.n_feature_sets())?;
        let folds = plan_folds(self.config, dataset.n_samples())?;

        let mut results = Vec::with_capacity(folds.len());
        for fold in &folds {
            tracing::info!("Fold {}", fold.number);
            let data = FoldData::prepare(dataset, fold, self.config)?;
            if data.n_feature_sets() != n_sets {
                return Err(EnsembleError::ShapeMismatch(format!(
                    "fold {} has {} feature sets, expected {}",
                    fold.number,
                    data.n_feature_sets(),
                    n_sets
                )));
            }

            let evaluation = self.evaluate_ensemble(&data, mode)?;
            results.push(FoldResult {
                fold: evaluation.fold,
                rmse: evaluation.rmse,
                nll: evaluation.nll,
                members: evaluation.members,
            });
        }

        let summary = CrossValidationSummary::from_folds(results, n_sets);
        tracing::info!("Final {} fold results", summary.folds.len());
        tracing::info!(
            "val RMSE {:.3}, +/- {:.3}",
            summary.rmse.mean,
            summary.rmse.std
        );
        for (i, nll) in summary.nll.iter().enumerate() {
            tracing::info!(
                "feature set {}, val NLL {:.3}, +/- {:.3}",
                i,
                nll.mean,
                nll.std
            );
        }

        Ok(summary)
    }
}
