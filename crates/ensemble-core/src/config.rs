use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::{EnsembleError, EnsembleResult};

/// Dataset name that switches the driver to the fixed contiguous split.
pub const FIXED_SPLIT_DATASET: &str = "msd";

/// Predictive-distribution layout produced by each member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelVariant {
    /// One independent Gaussian head per feature set (`combined_pog`).
    #[serde(rename = "combined_pog")]
    IndependentHeads,
    /// One joint Gaussian with a component per feature set (`combined_multivariate`).
    #[serde(rename = "combined_multivariate")]
    Multivariate,
}

impl ModelVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelVariant::IndependentHeads => "combined_pog",
            ModelVariant::Multivariate => "combined_multivariate",
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelVariant {
    type Err = EnsembleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "combined_pog" => Ok(ModelVariant::IndependentHeads),
            "combined_multivariate" => Ok(ModelVariant::Multivariate),
            other => Err(EnsembleError::Configuration(format!(
                "unknown build_model '{other}' (expected combined_pog or combined_multivariate)"
            ))),
        }
    }
}

/// What the scaler does with a constant training column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZeroVariancePolicy {
    /// Leave the column centred but unscaled and log a warning.
    UnitScale,
    /// Fail the fold with a numerical error.
    Error,
}

impl FromStr for ZeroVariancePolicy {
    type Err = EnsembleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unit_scale" => Ok(ZeroVariancePolicy::UnitScale),
            "error" => Ok(ZeroVariancePolicy::Error),
            other => Err(EnsembleError::Configuration(format!(
                "unknown zero_variance policy '{other}' (expected unit_scale or error)"
            ))),
        }
    }
}

/// Which member means enter the epistemic term of the total-variance split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceDecomposition {
    /// `mean(sigma^2 + mu_ens^2) - mu_ens^2`: the ensemble mean stands in for
    /// every member mean, so the epistemic term is zero.
    EnsembleMean,
    /// `mean(sigma^2 + mu_m^2) - mu_ens^2` with each member's own scalar mean.
    MemberMeans,
}

impl FromStr for VarianceDecomposition {
    type Err = EnsembleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ensemble_mean" => Ok(VarianceDecomposition::EnsembleMean),
            "member_means" => Ok(VarianceDecomposition::MemberMeans),
            other => Err(EnsembleError::Configuration(format!(
                "unknown variance_decomposition '{other}' (expected ensemble_mean or member_means)"
            ))),
        }
    }
}

/// How samples are partitioned into folds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldStrategy {
    /// Shuffled k-fold with `n_folds` folds.
    KFold,
    /// One fold: train on `[0, 463715)`, validate on `[463715, 515345)`.
    FixedSplit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleConfig {
    pub n_folds: usize,
    pub n_models: usize,
    /// Expected feature-set count; checked against the data when set.
    pub n_feature_sets: Option<usize>,
    pub epochs: usize,
    pub batch_size: usize,
    pub lr: f64,
    /// 0 = summaries only, 1 = per-sample ensemble lines, 2 = per-sample member lines.
    pub verbose: u8,
    pub model_dir: PathBuf,
    pub dataset: String,
    pub build_model: ModelVariant,
    pub plot_name: PathBuf,
    pub seed: u64,
    pub zero_variance: ZeroVariancePolicy,
    pub variance_decomposition: VarianceDecomposition,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            n_folds: 5,
            n_models: 5,
            n_feature_sets: None,
            epochs: 40,
            batch_size: 32,
            lr: 0.001,
            verbose: 0,
            model_dir: PathBuf::from("models"),
            dataset: String::new(),
            build_model: ModelVariant::IndependentHeads,
            plot_name: PathBuf::from("deferral.json"),
            seed: 42,
            zero_variance: ZeroVariancePolicy::UnitScale,
            variance_decomposition: VarianceDecomposition::EnsembleMean,
        }
    }
}

fn env_or<T>(key: &str, default: &str) -> EnsembleResult<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    raw.parse()
        .map_err(|e| EnsembleError::Configuration(format!("{key}='{raw}': {e}")))
}

impl EnsembleConfig {
    /// Read `ENSEMBLE_*` variables, falling back to the defaults.
    pub fn from_env() -> EnsembleResult<Self> {
        let n_feature_sets = match env::var("ENSEMBLE_N_FEATURE_SETS") {
            Ok(raw) => Some(raw.parse().map_err(|e| {
                EnsembleError::Configuration(format!("ENSEMBLE_N_FEATURE_SETS='{raw}': {e}"))
            })?),
            Err(_) => None,
        };

        let config = Self {
            n_folds: env_or("ENSEMBLE_N_FOLDS", "5")?,
            n_models: env_or("ENSEMBLE_N_MODELS", "5")?,
            n_feature_sets,
            epochs: env_or("ENSEMBLE_EPOCHS", "40")?,
            batch_size: env_or("ENSEMBLE_BATCH_SIZE", "32")?,
            lr: env_or("ENSEMBLE_LR", "0.001")?,
            verbose: env_or("ENSEMBLE_VERBOSE", "0")?,
            model_dir: PathBuf::from(
                env::var("ENSEMBLE_MODEL_DIR").unwrap_or_else(|_| "models".to_string()),
            ),
            dataset: env::var("ENSEMBLE_DATASET").unwrap_or_default(),
            build_model: env_or("ENSEMBLE_BUILD_MODEL", "combined_pog")?,
            plot_name: PathBuf::from(
                env::var("ENSEMBLE_PLOT_NAME").unwrap_or_else(|_| "deferral.json".to_string()),
            ),
            seed: env_or("ENSEMBLE_SEED", "42")?,
            zero_variance: env_or("ENSEMBLE_ZERO_VARIANCE", "unit_scale")?,
            variance_decomposition: env_or("ENSEMBLE_VARIANCE_DECOMPOSITION", "ensemble_mean")?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EnsembleResult<()> {
        if self.n_models == 0 {
            return Err(EnsembleError::Configuration("n_models must be > 0".into()));
        }
        if self.fold_strategy() == FoldStrategy::KFold && self.n_folds < 2 {
            return Err(EnsembleError::Configuration(format!(
                "n_folds must be >= 2, got {}",
                self.n_folds
            )));
        }
        if self.epochs == 0 {
            return Err(EnsembleError::Configuration("epochs must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(EnsembleError::Configuration("batch_size must be > 0".into()));
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(EnsembleError::Configuration(format!(
                "lr must be a positive number, got {}",
                self.lr
            )));
        }
        if self.verbose > 2 {
            return Err(EnsembleError::Configuration(format!(
                "verbose must be 0, 1 or 2, got {}",
                self.verbose
            )));
        }
        if self.n_feature_sets == Some(0) {
            return Err(EnsembleError::Configuration(
                "n_feature_sets must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn fold_strategy(&self) -> FoldStrategy {
        if self.dataset == FIXED_SPLIT_DATASET {
            FoldStrategy::FixedSplit
        } else {
            FoldStrategy::KFold
        }
    }

    /// Resolve the feature-set count for a run, rejecting a mismatch with the
    /// configured value.
    pub fn resolve_feature_sets(&self, found: usize) -> EnsembleResult<usize> {
        if found == 0 {
            return Err(EnsembleError::ShapeMismatch(
                "at least one feature set is required".into(),
            ));
        }
        match self.n_feature_sets {
            Some(expected) if expected != found => Err(EnsembleError::ShapeMismatch(format!(
                "configured n_feature_sets={expected} but the data has {found}"
            ))),
            _ => Ok(found),
        }
    }
}
