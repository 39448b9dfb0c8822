use ensemble_core::{Dataset, EnsembleResult, VarianceDecomposition};
use nalgebra::{DMatrix, DVector};

use crate::aggregator::Mode;
use crate::folds::{plan_folds, FoldData};
use crate::pipeline::EnsemblePipeline;

/// Out-of-fold ensemble predictions concatenated across every fold.
///
/// Rows follow fold order, then validation order within the fold; they are not
/// in original sample order. `sample_indices[r]` maps row `r` back to the input.
#[derive(Debug, Clone)]
pub struct CollectedPredictions {
    pub means: DVector<f64>,
    /// Rows x feature sets.
    pub std_devs: DMatrix<f64>,
    pub true_values: DVector<f64>,
    pub sample_indices: Vec<usize>,
}

impl CollectedPredictions {
    pub fn n_samples(&self) -> usize {
        self.means.len()
    }

    pub fn n_feature_sets(&self) -> usize {
        self.std_devs.ncols()
    }
}

impl EnsemblePipeline<'_> {
    /// Restore every fold's members from checkpoints and gather their
    /// validation predictions. Never trains.
    ///
    /// Spread is always the full total variance, member means included, so the
    /// ranking signal reflects member disagreement whatever decomposition the
    /// cross-validation summary uses.
    pub fn collect_predictions(&self, dataset: &Dataset) -> EnsembleResult<CollectedPredictions> {
        self.config.validate()?;
        let n_sets = self.config.resolve_feature_sets(dataset.n_feature_sets())?;
        let folds = plan_folds(self.config, dataset.n_samples())?;

        let mut means = Vec::new();
        let mut std_rows: Vec<f64> = Vec::new();
        let mut true_values = Vec::new();
        let mut sample_indices = Vec::new();

        for fold in &folds {
            tracing::info!("Fold {}", fold.number);
            let data = FoldData::prepare(dataset, fold, self.config)?;
            let evaluation =
                self.evaluate_with(&data, Mode::Evaluate, VarianceDecomposition::MemberMeans)?;
            let prediction = &evaluation.prediction;

            for r in 0..prediction.n_samples() {
                means.push(prediction.mean[r]);
                std_rows.extend(prediction.std_dev.row(r).iter());
                true_values.push(data.y_val[r]);
            }
            sample_indices.extend_from_slice(&data.validation_indices);
            tracing::info!("Val RMSE: {:.3}", evaluation.rmse);
        }

        let m = means.len();
        Ok(CollectedPredictions {
            means: DVector::from_vec(means),
            std_devs: DMatrix::from_row_slice(m, n_sets, &std_rows),
            true_values: DVector::from_vec(true_values),
            sample_indices,
        })
    }
}
