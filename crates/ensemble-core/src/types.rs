use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{EnsembleError, EnsembleResult};

/// Parallel feature views over the same samples, plus the aligned target.
#[derive(Debug, Clone)]
pub struct Dataset {
    feature_sets: Vec<DMatrix<f64>>,
    target: DVector<f64>,
}

impl Dataset {
    pub fn new(feature_sets: Vec<DMatrix<f64>>, target: DVector<f64>) -> EnsembleResult<Self> {
        if feature_sets.is_empty() {
            return Err(EnsembleError::ShapeMismatch(
                "at least one feature set is required".into(),
            ));
        }
        for (i, set) in feature_sets.iter().enumerate() {
            if set.nrows() != target.len() {
                return Err(EnsembleError::ShapeMismatch(format!(
                    "feature set {} has {} samples but the target has {}",
                    i,
                    set.nrows(),
                    target.len()
                )));
            }
            if set.ncols() == 0 {
                return Err(EnsembleError::ShapeMismatch(format!(
                    "feature set {i} has no columns"
                )));
            }
        }
        Ok(Self {
            feature_sets,
            target,
        })
    }

    /// Build from row-major nested vectors, the layout of the JSON dataset file.
    pub fn from_rows(feature_sets: Vec<Vec<Vec<f64>>>, target: Vec<f64>) -> EnsembleResult<Self> {
        let mut matrices = Vec::with_capacity(feature_sets.len());
        for (i, rows) in feature_sets.into_iter().enumerate() {
            let ncols = rows.first().map(|r| r.len()).unwrap_or(0);
            if let Some((r, row)) = rows.iter().enumerate().find(|(_, row)| row.len() != ncols) {
                return Err(EnsembleError::ShapeMismatch(format!(
                    "feature set {} row {} has {} columns, expected {}",
                    i,
                    r,
                    row.len(),
                    ncols
                )));
            }
            let nrows = rows.len();
            let flat: Vec<f64> = rows.into_iter().flatten().collect();
            matrices.push(DMatrix::from_row_slice(nrows, ncols, &flat));
        }
        Self::new(matrices, DVector::from_vec(target))
    }

    pub fn from_json_reader<R: std::io::Read>(reader: R) -> EnsembleResult<Self> {
        let file: DatasetFile = serde_json::from_reader(reader)?;
        Self::from_rows(file.feature_sets, file.target)
    }

    pub fn n_samples(&self) -> usize {
        self.target.len()
    }

    pub fn n_feature_sets(&self) -> usize {
        self.feature_sets.len()
    }

    pub fn input_dims(&self) -> Vec<usize> {
        self.feature_sets.iter().map(|m| m.ncols()).collect()
    }

    pub fn feature_sets(&self) -> &[DMatrix<f64>] {
        &self.feature_sets
    }

    pub fn target(&self) -> &DVector<f64> {
        &self.target
    }

    /// Copy the given rows out of every feature set and the target.
    pub fn select(&self, indices: &[usize]) -> (Vec<DMatrix<f64>>, DVector<f64>) {
        let sets = self
            .feature_sets
            .iter()
            .map(|m| m.select_rows(indices.iter()))
            .collect();
        (sets, self.target.select_rows(indices.iter()))
    }
}

/// On-disk dataset layout: `feature_sets[set][sample][feature]`, `target[sample]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetFile {
    pub feature_sets: Vec<Vec<Vec<f64>>>,
    pub target: Vec<f64>,
}

/// Identifies one persisted ensemble member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointKey {
    /// 1-based fold number.
    pub fold: usize,
    pub member: usize,
}

impl CheckpointKey {
    pub fn new(fold: usize, member: usize) -> Self {
        Self { fold, member }
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fold_{}_nll_{}", self.fold, self.member)
    }
}

/// Serialized parameters of one trained member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelWeights {
    pub architecture: String,
    pub input_dims: Vec<usize>,
    pub params: Vec<f64>,
}

/// Gaussian belief of a single feature set over a batch of samples.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianPrediction {
    pub mean: DVector<f64>,
    pub std_dev: DVector<f64>,
}

impl GaussianPrediction {
    pub fn new(mean: DVector<f64>, std_dev: DVector<f64>) -> Self {
        Self { mean, std_dev }
    }

    /// Same (mean, std) for every sample.
    pub fn constant(n_samples: usize, mean: f64, std_dev: f64) -> Self {
        Self {
            mean: DVector::from_element(n_samples, mean),
            std_dev: DVector::from_element(n_samples, std_dev),
        }
    }
}

/// Joint Gaussian with one component per feature set (samples x components).
#[derive(Debug, Clone, PartialEq)]
pub struct JointGaussian {
    pub mean: DMatrix<f64>,
    pub std_dev: DMatrix<f64>,
}

/// What a member returns for one batch: either independent per-feature-set
/// Gaussians or a single joint Gaussian with a vector mean.
#[derive(Debug, Clone, PartialEq)]
pub enum PredictionShape {
    PerFeatureSet(Vec<GaussianPrediction>),
    Joint(JointGaussian),
}

impl PredictionShape {
    pub fn n_samples(&self) -> usize {
        match self {
            PredictionShape::PerFeatureSet(sets) => sets.first().map(|g| g.mean.len()).unwrap_or(0),
            PredictionShape::Joint(joint) => joint.mean.nrows(),
        }
    }

    pub fn n_feature_sets(&self) -> usize {
        match self {
            PredictionShape::PerFeatureSet(sets) => sets.len(),
            PredictionShape::Joint(joint) => joint.mean.ncols(),
        }
    }

    /// Single point prediction per sample: the first feature set's mean, or the
    /// first component of the joint mean.
    pub fn scalar_mean(&self) -> DVector<f64> {
        self.per_feature_set_mean(0)
    }

    pub fn per_feature_set_mean(&self, i: usize) -> DVector<f64> {
        match self {
            PredictionShape::PerFeatureSet(sets) => sets[i].mean.clone(),
            PredictionShape::Joint(joint) => joint.mean.column(i).into_owned(),
        }
    }

    pub fn per_feature_set_std(&self, i: usize) -> DVector<f64> {
        match self {
            PredictionShape::PerFeatureSet(sets) => sets[i].std_dev.clone(),
            PredictionShape::Joint(joint) => joint.std_dev.column(i).into_owned(),
        }
    }

    /// Check the prediction covers `n_samples` x `n_feature_sets` with finite
    /// means and finite, strictly positive standard deviations.
    pub fn check(&self, n_samples: usize, n_feature_sets: usize) -> Result<(), String> {
        if self.n_feature_sets() != n_feature_sets {
            return Err(format!(
                "prediction has {} feature sets, expected {}",
                self.n_feature_sets(),
                n_feature_sets
            ));
        }
        for i in 0..n_feature_sets {
            let mean = self.per_feature_set_mean(i);
            let std_dev = self.per_feature_set_std(i);
            if mean.len() != n_samples || std_dev.len() != n_samples {
                return Err(format!(
                    "feature set {} prediction has {} samples, expected {}",
                    i,
                    mean.len(),
                    n_samples
                ));
            }
            if let Some(r) = mean.iter().position(|m| !m.is_finite()) {
                return Err(format!("non-finite mean for feature set {i} at sample {r}"));
            }
            if let Some(r) = std_dev.iter().position(|s| !s.is_finite() || *s <= 0.0) {
                return Err(format!(
                    "invalid standard deviation {} for feature set {} at sample {}",
                    std_dev[r], i, r
                ));
            }
        }
        Ok(())
    }
}

/// Combined ensemble belief for a batch of samples.
///
/// `mean` is one scalar per sample shared across feature sets; spread is kept
/// per feature set (columns of the matrices).
#[derive(Debug, Clone, PartialEq)]
pub struct EnsemblePrediction {
    pub mean: DVector<f64>,
    pub std_dev: DMatrix<f64>,
    /// Mean of member variances.
    pub aleatoric_variance: DMatrix<f64>,
    /// Dispersion of member means around the ensemble mean.
    pub epistemic_variance: DMatrix<f64>,
}

impl EnsemblePrediction {
    pub fn n_samples(&self) -> usize {
        self.mean.len()
    }

    pub fn n_feature_sets(&self) -> usize {
        self.std_dev.ncols()
    }

    pub fn std_dev_for(&self, feature_set: usize) -> DVector<f64> {
        self.std_dev.column(feature_set).into_owned()
    }

    /// Split the predictive variance of one feature set into its two sources.
    pub fn decomposition(&self, feature_set: usize) -> UncertaintyDecomposition {
        let aleatoric = self.aleatoric_variance.column(feature_set).into_owned();
        let epistemic = self.epistemic_variance.column(feature_set).into_owned();
        let total = &aleatoric + &epistemic;
        UncertaintyDecomposition {
            aleatoric,
            epistemic,
            total,
        }
    }
}

/// Per-sample variance of one feature set, `total = aleatoric + epistemic`.
#[derive(Debug, Clone, PartialEq)]
pub struct UncertaintyDecomposition {
    pub aleatoric: DVector<f64>,
    pub epistemic: DVector<f64>,
    pub total: DVector<f64>,
}

impl UncertaintyDecomposition {
    /// Share of the total variance explained by member disagreement, per sample.
    /// Zero where the total is zero.
    pub fn epistemic_fraction(&self) -> DVector<f64> {
        self.epistemic.zip_map(&self.total, |e, t| if t > 0.0 { e / t } else { 0.0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decomposition_sums_to_total() {
        let prediction = EnsemblePrediction {
            mean: DVector::from_vec(vec![1.0, 2.0]),
            std_dev: DMatrix::from_row_slice(2, 1, &[2.0, 0.0]),
            aleatoric_variance: DMatrix::from_row_slice(2, 1, &[3.0, 0.0]),
            epistemic_variance: DMatrix::from_row_slice(2, 1, &[1.0, 0.0]),
        };
        let d = prediction.decomposition(0);
        assert_eq!(d.total, DVector::from_vec(vec![4.0, 0.0]));
        assert_eq!(d.epistemic_fraction(), DVector::from_vec(vec![0.25, 0.0]));
    }

    #[test]
    fn test_dataset_rejects_misaligned_feature_set() {
        let sets = vec![DMatrix::zeros(4, 2), DMatrix::zeros(3, 1)];
        let err = Dataset::new(sets, DVector::zeros(4)).unwrap_err();
        assert!(matches!(err, EnsembleError::ShapeMismatch(_)));
        assert!(err.to_string().contains("feature set 1"));
    }

    #[test]
    fn test_dataset_rejects_empty_and_ragged_input() {
        assert!(Dataset::new(Vec::new(), DVector::zeros(2)).is_err());

        let ragged = vec![vec![vec![1.0, 2.0], vec![3.0]]];
        let err = Dataset::from_rows(ragged, vec![0.0, 1.0]).unwrap_err();
        assert!(err.to_string().contains("row 1"));
    }

    #[test]
    fn test_dataset_from_json_and_select() {
        let json = r#"{
            "feature_sets": [[[1.0, 10.0], [2.0, 20.0], [3.0, 30.0]], [[7.0], [8.0], [9.0]]],
            "target": [0.5, 1.5, 2.5]
        }"#;
        let data = Dataset::from_json_reader(json.as_bytes()).unwrap();
        assert_eq!(data.n_samples(), 3);
        assert_eq!(data.input_dims(), vec![2, 1]);

        let (sets, target) = data.select(&[2, 0]);
        assert_eq!(sets[0][(0, 1)], 30.0);
        assert_eq!(sets[0][(1, 0)], 1.0);
        assert_eq!(sets[1][(0, 0)], 9.0);
        assert_eq!(target.as_slice(), &[2.5, 0.5]);
    }

    #[test]
    fn test_checkpoint_key_display() {
        assert_eq!(CheckpointKey::new(2, 4).to_string(), "fold_2_nll_4");
    }

    #[test]
    fn test_prediction_shape_accessors() {
        let per_set = PredictionShape::PerFeatureSet(vec![
            GaussianPrediction::constant(3, 1.0, 0.5),
            GaussianPrediction::constant(3, 2.0, 0.25),
        ]);
        assert_eq!(per_set.scalar_mean(), DVector::from_element(3, 1.0));
        assert_eq!(per_set.per_feature_set_std(1), DVector::from_element(3, 0.25));

        let joint = PredictionShape::Joint(JointGaussian {
            mean: DMatrix::from_row_slice(2, 2, &[1.0, 9.0, 2.0, 8.0]),
            std_dev: DMatrix::from_row_slice(2, 2, &[0.1, 0.2, 0.3, 0.4]),
        });
        assert_eq!(joint.n_feature_sets(), 2);
        assert_eq!(joint.scalar_mean().as_slice(), &[1.0, 2.0]);
        assert_eq!(joint.per_feature_set_std(1).as_slice(), &[0.2, 0.4]);
    }

    #[test]
    fn test_prediction_check_flags_bad_values() {
        let ok = PredictionShape::PerFeatureSet(vec![GaussianPrediction::constant(2, 0.0, 1.0)]);
        assert!(ok.check(2, 1).is_ok());
        assert!(ok.check(3, 1).is_err());
        assert!(ok.check(2, 2).is_err());

        let nan = PredictionShape::PerFeatureSet(vec![GaussianPrediction::constant(2, f64::NAN, 1.0)]);
        assert!(nan.check(2, 1).unwrap_err().contains("non-finite mean"));

        let zero = PredictionShape::PerFeatureSet(vec![GaussianPrediction::constant(2, 0.0, 0.0)]);
        assert!(zero.check(2, 1).unwrap_err().contains("standard deviation"));
    }
}
