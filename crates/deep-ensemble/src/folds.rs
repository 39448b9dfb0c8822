//! Fold planning for cross-validation and per-fold data preparation.

use ensemble_core::{Dataset, EnsembleConfig, EnsembleError, EnsembleResult, FoldStrategy};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;

use crate::scaler::scale_feature_sets;

/// End (exclusive) of the fixed training range.
pub const FIXED_SPLIT_TRAIN_END: usize = 463_715;
/// End (exclusive) of the fixed validation range.
pub const FIXED_SPLIT_VALIDATION_END: usize = 515_345;

/// Disjoint train/validation sample indices for one fold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fold {
    /// 1-based, also the fold part of every checkpoint key.
    pub number: usize,
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
}

/// Shuffled k-fold partition driven by `rng`.
///
/// The first `n_samples % n_folds` folds hold one extra validation sample.
/// Index lists within a fold are sorted ascending.
pub fn k_fold(n_samples: usize, n_folds: usize, rng: &mut StdRng) -> EnsembleResult<Vec<Fold>> {
    if n_folds < 2 {
        return Err(EnsembleError::Configuration(format!(
            "k-fold needs at least 2 folds, got {n_folds}"
        )));
    }
    if n_folds > n_samples {
        return Err(EnsembleError::ShapeMismatch(format!(
            "cannot split {n_samples} samples into {n_folds} folds"
        )));
    }

    let mut order: Vec<usize> = (0..n_samples).collect();
    order.shuffle(rng);

    let base = n_samples / n_folds;
    let extra = n_samples % n_folds;
    let mut folds = Vec::with_capacity(n_folds);
    let mut start = 0;

    for f in 0..n_folds {
        let size = base + usize::from(f < extra);
        let mut validation = order[start..start + size].to_vec();
        validation.sort_unstable();

        let mut in_validation = vec![false; n_samples];
        for &i in &validation {
            in_validation[i] = true;
        }
        let train = (0..n_samples).filter(|&i| !in_validation[i]).collect();

        folds.push(Fold {
            number: f + 1,
            train,
            validation,
        });
        start += size;
    }

    Ok(folds)
}

/// The single contiguous split used for the large fixed-split dataset.
pub fn fixed_split(n_samples: usize) -> EnsembleResult<Vec<Fold>> {
    if n_samples < FIXED_SPLIT_VALIDATION_END {
        return Err(EnsembleError::ShapeMismatch(format!(
            "fixed split needs at least {FIXED_SPLIT_VALIDATION_END} samples, got {n_samples}"
        )));
    }
    Ok(vec![Fold {
        number: 1,
        train: (0..FIXED_SPLIT_TRAIN_END).collect(),
        validation: (FIXED_SPLIT_TRAIN_END..FIXED_SPLIT_VALIDATION_END).collect(),
    }])
}

/// Folds for a run, seeded from `config.seed`.
pub fn plan_folds(config: &EnsembleConfig, n_samples: usize) -> EnsembleResult<Vec<Fold>> {
    match config.fold_strategy() {
        FoldStrategy::FixedSplit => fixed_split(n_samples),
        FoldStrategy::KFold => {
            let mut rng = StdRng::seed_from_u64(config.seed);
            k_fold(n_samples, config.n_folds, &mut rng)
        }
    }
}

/// One fold's standardized inputs and targets.
#[derive(Debug, Clone)]
pub struct FoldData {
    pub fold: usize,
    pub x_train: Vec<DMatrix<f64>>,
    pub y_train: DVector<f64>,
    pub x_val: Vec<DMatrix<f64>>,
    pub y_val: DVector<f64>,
    /// Original sample index of each validation row.
    pub validation_indices: Vec<usize>,
}

impl FoldData {
    pub fn prepare(dataset: &Dataset, fold: &Fold, config: &EnsembleConfig) -> EnsembleResult<Self> {
        let (x_train_raw, y_train) = dataset.select(&fold.train);
        let (x_val_raw, y_val) = dataset.select(&fold.validation);
        let (x_train, x_val) =
            scale_feature_sets(fold.number, &x_train_raw, &x_val_raw, config.zero_variance)?;

        Ok(Self {
            fold: fold.number,
            x_train,
            y_train,
            x_val,
            y_val,
            validation_indices: fold.validation.clone(),
        })
    }

    pub fn n_feature_sets(&self) -> usize {
        self.x_train.len()
    }

    pub fn input_dims(&self) -> Vec<usize> {
        self.x_train.iter().map(|m| m.ncols()).collect()
    }
}
