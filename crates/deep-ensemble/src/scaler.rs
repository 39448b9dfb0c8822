//! Per-column standardization fitted on a training split.

use ensemble_core::{EnsembleError, EnsembleResult, ZeroVariancePolicy};
use nalgebra::{DMatrix, RowDVector};

/// Columns whose standard deviation falls below this are treated as constant.
const ZERO_VARIANCE_TOLERANCE: f64 = 10.0 * f64::EPSILON;

/// A column is constant when its variance is within the rounding error of
/// computing the mean: `var <= n * eps * mean^2`, or below the absolute floor
/// for columns centred on zero.
fn is_constant_column(variance: f64, mean: f64, n_rows: usize) -> bool {
    variance.sqrt() < ZERO_VARIANCE_TOLERANCE
        || variance <= n_rows as f64 * f64::EPSILON * mean * mean
}

#[derive(Debug, Clone, PartialEq)]
pub struct StandardScaler {
    mean: RowDVector<f64>,
    scale: RowDVector<f64>,
}

impl StandardScaler {
    /// Fit column means and population standard deviations on `train`.
    ///
    /// Errors carry fold 0; callers re-tag them with [`EnsembleError::in_fold`].
    pub fn fit(train: &DMatrix<f64>, policy: ZeroVariancePolicy) -> EnsembleResult<Self> {
        if train.nrows() == 0 {
            return Err(EnsembleError::ShapeMismatch(
                "cannot fit a scaler on an empty training split".into(),
            ));
        }
        if let Some(pos) = train.iter().position(|v| !v.is_finite()) {
            return Err(EnsembleError::numerical(
                0,
                None,
                format!(
                    "non-finite value at row {}, column {}",
                    pos % train.nrows(),
                    pos / train.nrows()
                ),
            ));
        }

        let mean = train.row_mean();
        let variance = train.row_variance();
        let mut scale = variance.map(f64::sqrt);

        for (col, s) in scale.iter_mut().enumerate() {
            if is_constant_column(variance[col], mean[col], train.nrows()) {
                match policy {
                    ZeroVariancePolicy::UnitScale => {
                        tracing::warn!("Column {} has zero variance; leaving it unscaled", col);
                        *s = 1.0;
                    }
                    ZeroVariancePolicy::Error => {
                        return Err(EnsembleError::numerical(
                            0,
                            None,
                            format!("column {col} has zero variance in the training split"),
                        ));
                    }
                }
            }
        }

        Ok(Self { mean, scale })
    }

    pub fn transform(&self, x: &DMatrix<f64>) -> EnsembleResult<DMatrix<f64>> {
        if x.ncols() != self.mean.len() {
            return Err(EnsembleError::ShapeMismatch(format!(
                "scaler fitted on {} columns, got {}",
                self.mean.len(),
                x.ncols()
            )));
        }
        let mut out = x.clone();
        for (c, mut column) in out.column_iter_mut().enumerate() {
            let (mean, scale) = (self.mean[c], self.scale[c]);
            column.apply(|v| *v = (*v - mean) / scale);
        }
        Ok(out)
    }

    pub fn mean(&self) -> &RowDVector<f64> {
        &self.mean
    }

    pub fn scale(&self) -> &RowDVector<f64> {
        &self.scale
    }
}

/// Fit on `train` only and apply the same statistics to both splits.
pub fn fit_transform(
    train: &DMatrix<f64>,
    test: &DMatrix<f64>,
    policy: ZeroVariancePolicy,
) -> EnsembleResult<(DMatrix<f64>, DMatrix<f64>)> {
    let scaler = StandardScaler::fit(train, policy)?;
    Ok((scaler.transform(train)?, scaler.transform(test)?))
}

/// Standardize every feature set of one fold independently.
pub fn scale_feature_sets(
    fold: usize,
    x_train: &[DMatrix<f64>],
    x_val: &[DMatrix<f64>],
    policy: ZeroVariancePolicy,
) -> EnsembleResult<(Vec<DMatrix<f64>>, Vec<DMatrix<f64>>)> {
    let mut train_scaled = Vec::with_capacity(x_train.len());
    let mut val_scaled = Vec::with_capacity(x_val.len());
    for (i, (train, val)) in x_train.iter().zip(x_val).enumerate() {
        let (t, v) = fit_transform(train, val, policy).map_err(|e| match e {
            EnsembleError::Numerical { detail, .. } => {
                EnsembleError::numerical(fold, None, format!("feature set {i}: {detail}"))
            }
            other => other.in_fold(fold),
        })?;
        train_scaled.push(t);
        val_scaled.push(v);
    }
    Ok((train_scaled, val_scaled))
}
