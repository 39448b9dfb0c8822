//! Combining member Gaussians into one ensemble Gaussian per feature set.

use ensemble_core::{
    CheckpointKey, EnsembleError, EnsembleResult, EnsemblePrediction, PredictionShape,
    VarianceDecomposition,
};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::Serialize;

use crate::folds::FoldData;
use crate::metrics;
use crate::pipeline::EnsemblePipeline;
use crate::trainer::TrainingReport;

/// Whether members are trained now or restored from checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Evaluate,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberSummary {
    pub member: usize,
    pub val_rmse: f64,
    /// Present only when the member was trained in this run.
    pub training: Option<TrainingReport>,
}

#[derive(Debug, Clone)]
pub struct FoldEvaluation {
    pub fold: usize,
    pub rmse: f64,
    /// One entry per feature set.
    pub nll: Vec<f64>,
    pub prediction: EnsemblePrediction,
    pub members: Vec<MemberSummary>,
}

/// Law-of-total-variance combination of member predictions.
///
/// The ensemble mean is the average of the members' scalar means. For feature
/// set `i` the ensemble variance is `mean_m(sigma_mi^2 + mu_m^2) - mu_ens^2`,
/// evaluated as aleatoric `mean_m(sigma_mi^2)` plus epistemic
/// `mean_m((mu_m - mu_ens)^2)` to avoid cancellation. Under
/// [`VarianceDecomposition::EnsembleMean`] every `mu_m` is replaced by
/// `mu_ens`, so the epistemic term is zero.
pub fn combine_members(
    members: &[PredictionShape],
    decomposition: VarianceDecomposition,
) -> EnsembleResult<EnsemblePrediction> {
    let first = members.first().ok_or_else(|| {
        EnsembleError::Configuration("cannot combine an empty ensemble".into())
    })?;
    let n_samples = first.n_samples();
    let n_sets = first.n_feature_sets();
    if n_sets == 0 {
        return Err(EnsembleError::ShapeMismatch(
            "member predictions cover no feature sets".into(),
        ));
    }
    if let Some((m, _)) = members
        .iter()
        .enumerate()
        .find(|(_, p)| p.n_samples() != n_samples || p.n_feature_sets() != n_sets)
    {
        return Err(EnsembleError::ShapeMismatch(format!(
            "member {} disagrees with member 0 on prediction shape",
            m
        )));
    }

    let n_members = members.len() as f64;
    let scalar_means: Vec<DVector<f64>> = members.iter().map(|p| p.scalar_mean()).collect();
    let mean = scalar_means
        .iter()
        .fold(DVector::<f64>::zeros(n_samples), |acc, mu| acc + mu)
        / n_members;

    let epistemic_column = match decomposition {
        VarianceDecomposition::EnsembleMean => DVector::zeros(n_samples),
        VarianceDecomposition::MemberMeans => {
            scalar_means
                .iter()
                .fold(DVector::<f64>::zeros(n_samples), |acc: DVector<f64>, mu| {
                    acc + (mu - &mean).map(|d| d * d)
                })
                / n_members
        }
    };

    let mut aleatoric = DMatrix::zeros(n_samples, n_sets);
    let mut epistemic = DMatrix::zeros(n_samples, n_sets);
    for i in 0..n_sets {
        let mean_var = members
            .iter()
            .fold(DVector::<f64>::zeros(n_samples), |acc: DVector<f64>, p| {
                acc + p.per_feature_set_std(i).map(|s| s * s)
            })
            / n_members;
        aleatoric.set_column(i, &mean_var);
        epistemic.set_column(i, &epistemic_column);
    }

    let std_dev = (&aleatoric + &epistemic).map(f64::sqrt);

    Ok(EnsemblePrediction {
        mean,
        std_dev,
        aleatoric_variance: aleatoric,
        epistemic_variance: epistemic,
    })
}

impl EnsemblePipeline<'_> {
    /// Obtain every member for this fold, combine them with the configured
    /// variance decomposition, and score the ensemble on the validation split.
    pub fn evaluate_ensemble(&self, data: &FoldData, mode: Mode) -> EnsembleResult<FoldEvaluation> {
        self.evaluate_with(data, mode, self.config.variance_decomposition)
    }

    /// [`Self::evaluate_ensemble`] with an explicit decomposition.
    pub fn evaluate_with(
        &self,
        data: &FoldData,
        mode: Mode,
        decomposition: VarianceDecomposition,
    ) -> EnsembleResult<FoldEvaluation> {
        let fold = data.fold;
        let n_sets = data.n_feature_sets();
        let n_val = data.y_val.len();
        let dims = data.input_dims();

        let obtained: Vec<(PredictionShape, Option<TrainingReport>)> = match mode {
            Mode::Train => (0..self.config.n_models)
                .map(|member| {
                    let key = CheckpointKey::new(fold, member);
                    let (model, report) = self.train_member(key, data)?;
                    let prediction = model
                        .predict(&data.x_val)
                        .map_err(|e| e.in_member(fold, member))?;
                    Ok((prediction, Some(report)))
                })
                .collect::<EnsembleResult<_>>()?,
            Mode::Evaluate => (0..self.config.n_models)
                .into_par_iter()
                .map(|member| {
                    let key = CheckpointKey::new(fold, member);
                    let model = self.load_member(key, &dims)?;
                    let prediction = model
                        .predict(&data.x_val)
                        .map_err(|e| e.in_member(fold, member))?;
                    Ok((prediction, None))
                })
                .collect::<EnsembleResult<_>>()?,
        };

        let mut predictions = Vec::with_capacity(obtained.len());
        let mut members = Vec::with_capacity(obtained.len());
        for (member, (prediction, training)) in obtained.into_iter().enumerate() {
            prediction
                .check(n_val, n_sets)
                .map_err(|detail| EnsembleError::numerical(fold, Some(member), detail))?;

            let val_rmse = metrics::rmse(&data.y_val, &prediction.scalar_mean()).map_err(|detail| {
                EnsembleError::ShapeMismatch(format!("fold {fold}, member {member}: {detail}"))
            })?;
            tracing::info!("Member {} val RMSE: {:.3}", member, val_rmse);
            if self.config.verbose > 1 {
                self.log_member_samples(data, member, &prediction);
            }

            members.push(MemberSummary {
                member,
                val_rmse,
                training,
            });
            predictions.push(prediction);
        }

        let prediction = combine_members(&predictions, decomposition)?;
        let rmse = metrics::rmse(&data.y_val, &prediction.mean)
            .map_err(|detail| EnsembleError::ShapeMismatch(format!("fold {fold}: {detail}")))?;
        let nll = (0..n_sets)
            .map(|i| {
                metrics::mean_gaussian_nll(&data.y_val, &prediction.mean, &prediction.std_dev_for(i))
                    .map_err(|detail| {
                        EnsembleError::numerical(fold, None, format!("feature set {i}: {detail}"))
                    })
            })
            .collect::<EnsembleResult<Vec<f64>>>()?;

        tracing::info!("Deep Ensemble val RMSE {:.3}", rmse);
        for i in 0..n_sets {
            let parts = prediction.decomposition(i);
            tracing::debug!(
                "feature set {}: mean aleatoric var {:.4}, mean epistemic var {:.4}",
                i,
                parts.aleatoric.mean(),
                parts.epistemic.mean()
            );
        }
        if self.config.verbose > 0 {
            self.log_ensemble_samples(data, &prediction);
        }

        Ok(FoldEvaluation {
            fold,
            rmse,
            nll,
            prediction,
            members,
        })
    }

    fn log_member_samples(&self, data: &FoldData, member: usize, prediction: &PredictionShape) {
        let mean = prediction.scalar_mean();
        let stds: Vec<DVector<f64>> = (0..prediction.n_feature_sets())
            .map(|i| prediction.per_feature_set_std(i))
            .collect();
        for r in 0..mean.len() {
            let spread: Vec<String> = stds
                .iter()
                .enumerate()
                .map(|(j, s)| format!("std dev set {}: {:.5}", j, s[r]))
                .collect();
            tracing::info!(
                "member {} pred: {:.3}\ttrue: {:.3}\t{}",
                member,
                mean[r],
                data.y_val[r],
                spread.join("\t")
            );
        }
    }

    fn log_ensemble_samples(&self, data: &FoldData, prediction: &EnsemblePrediction) {
        for r in 0..prediction.n_samples() {
            let spread: Vec<String> = (0..prediction.n_feature_sets())
                .map(|j| format!("std dev set {}: {:.5}", j, prediction.std_dev[(r, j)]))
                .collect();
            tracing::info!(
                "ensemble pred: {:.3}\ttrue: {:.3}\t{}",
                prediction.mean[r],
                data.y_val[r],
                spread.join("\t")
            );
        }
    }
}
