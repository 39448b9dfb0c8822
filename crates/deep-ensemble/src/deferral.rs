//! Error as a function of how many of the most uncertain predictions are withheld.

use ensemble_core::{EnsembleError, EnsembleResult};
use serde::Serialize;

use crate::predictions::CollectedPredictions;

/// Two RMSE curves of length `M + 1`, indexed by the number of deferred samples.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeferralCurves {
    /// RMSE over the `k` samples with the highest ranking signal.
    pub deferred_rmse: Vec<f64>,
    /// RMSE over the rest once those `k` samples are withheld.
    pub non_deferred_rmse: Vec<f64>,
}

/// Rank samples ascending by `ranking_signal` and, for every `k` in `0..=M`,
/// score the `k` highest-signal samples (`deferred_rmse[k]`) and the remaining
/// `M - k` (`non_deferred_rmse[k]`). Empty sets score 0.
///
/// NaN signals sort after every number, i.e. they are deferred first.
pub fn analyze(
    true_values: &[f64],
    predictions: &[f64],
    ranking_signal: &[f64],
) -> EnsembleResult<DeferralCurves> {
    let m = true_values.len();
    if predictions.len() != m || ranking_signal.len() != m {
        return Err(EnsembleError::ShapeMismatch(format!(
            "deferral inputs differ in length: {} true values, {} predictions, {} signals",
            m,
            predictions.len(),
            ranking_signal.len()
        )));
    }
    if m == 0 {
        return Err(EnsembleError::ShapeMismatch(
            "deferral analysis needs at least one sample".into(),
        ));
    }

    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&a, &b| ranking_signal[a].total_cmp(&ranking_signal[b]));

    // prefix[j] = squared error summed over the j lowest-signal samples
    let mut prefix = Vec::with_capacity(m + 1);
    prefix.push(0.0);
    for &i in &order {
        let err = true_values[i] - predictions[i];
        let last = prefix[prefix.len() - 1];
        prefix.push(last + err * err);
    }
    let total = prefix[m];
    let full_rmse = (total / m as f64).sqrt();

    let mut deferred_rmse = Vec::with_capacity(m + 1);
    let mut non_deferred_rmse = Vec::with_capacity(m + 1);
    for k in 0..=m {
        let deferred = if k == 0 {
            0.0
        } else if k == m {
            full_rmse
        } else {
            ((total - prefix[m - k]).max(0.0) / k as f64).sqrt()
        };
        let kept = if k == 0 {
            full_rmse
        } else if k == m {
            0.0
        } else {
            (prefix[m - k] / (m - k) as f64).sqrt()
        };
        deferred_rmse.push(deferred);
        non_deferred_rmse.push(kept);
    }

    Ok(DeferralCurves {
        deferred_rmse,
        non_deferred_rmse,
    })
}

/// Curves for every feature set, ranking by that set's ensemble standard deviation.
pub fn analyze_feature_sets(collected: &CollectedPredictions) -> EnsembleResult<Vec<DeferralCurves>> {
    let truth = collected.true_values.as_slice();
    let means = collected.means.as_slice();
    (0..collected.n_feature_sets())
        .map(|i| {
            let signal: Vec<f64> = collected.std_devs.column(i).iter().copied().collect();
            analyze(truth, means, &signal)
        })
        .collect()
}
