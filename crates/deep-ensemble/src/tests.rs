use approx::assert_relative_eq;
use ensemble_core::{
    CheckpointKey, Dataset, EnsembleConfig, EnsembleError, EnsembleResult, GaussianPrediction,
    ModelFactory, ModelStore, ModelVariant, ModelWeights, PredictionShape, ProbabilisticModel,
    VarianceDecomposition,
};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::aggregator::Mode;
use crate::deferral::analyze_feature_sets;
use crate::folds::{plan_folds, FoldData};
use crate::gaussian_model::GaussianHeadsFactory;
use crate::pipeline::EnsemblePipeline;
use crate::store::MemoryModelStore;

/// Helper: two noisy views of a linear target.
fn synthetic_dataset(n: usize, seed: u64) -> Dataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let x0 = DMatrix::from_fn(n, 3, |_, _| rng.gen_range(-2.0..2.0));
    let x1 = DMatrix::from_fn(n, 2, |r, c| x0[(r, c)] * 0.5 + rng.gen_range(-0.3..0.3));
    let y = DVector::from_fn(n, |r, _| {
        1.5 * x0[(r, 0)] - 0.5 * x0[(r, 1)] + 2.0 + rng.gen_range(-0.2..0.2)
    });
    Dataset::new(vec![x0, x1], y).unwrap()
}

fn small_config() -> EnsembleConfig {
    EnsembleConfig {
        n_folds: 3,
        n_models: 2,
        epochs: 15,
        batch_size: 16,
        lr: 0.05,
        ..Default::default()
    }
}

/// Member that always predicts the same Gaussian for every feature set.
/// Its validation NLL follows `val_script`, one entry per epoch.
struct ScriptedModel {
    mean: f64,
    std_dev: f64,
    n_sets: usize,
    epoch: usize,
    val_script: Vec<f64>,
}

impl ProbabilisticModel for ScriptedModel {
    fn predict(&self, inputs: &[DMatrix<f64>]) -> EnsembleResult<PredictionShape> {
        let n = inputs[0].nrows();
        Ok(PredictionShape::PerFeatureSet(
            (0..self.n_sets)
                .map(|_| GaussianPrediction::constant(n, self.mean, self.std_dev))
                .collect(),
        ))
    }

    fn fit_epoch(
        &mut self,
        _inputs: &[DMatrix<f64>],
        _target: &DVector<f64>,
        _batch_size: usize,
        _rng: &mut StdRng,
    ) -> EnsembleResult<f64> {
        self.epoch += 1;
        Ok(10.0 / self.epoch as f64)
    }

    fn negative_log_likelihood(
        &self,
        _inputs: &[DMatrix<f64>],
        _target: &DVector<f64>,
    ) -> EnsembleResult<f64> {
        Ok(self.val_script[self.epoch - 1])
    }

    fn weights(&self) -> ModelWeights {
        ModelWeights {
            architecture: "scripted".to_string(),
            input_dims: Vec::new(),
            params: vec![self.epoch as f64],
        }
    }

    fn set_weights(&mut self, weights: &ModelWeights) -> EnsembleResult<()> {
        self.epoch = weights.params[0] as usize;
        Ok(())
    }
}

struct ScriptedFactory {
    mean: f64,
    std_dev: f64,
    val_script: Vec<f64>,
}

impl ModelFactory for ScriptedFactory {
    fn build_model(
        &self,
        _config: &EnsembleConfig,
        input_dims: &[usize],
        _seed: u64,
    ) -> EnsembleResult<Box<dyn ProbabilisticModel>> {
        Ok(Box::new(ScriptedModel {
            mean: self.mean,
            std_dev: self.std_dev,
            n_sets: input_dims.len(),
            epoch: 0,
            val_script: self.val_script.clone(),
        }))
    }
}

/// Member whose Gaussian is read straight from its weights: `[mean, std_dev]`.
struct StoredGaussian {
    n_sets: usize,
    params: Vec<f64>,
}

impl ProbabilisticModel for StoredGaussian {
    fn predict(&self, inputs: &[DMatrix<f64>]) -> EnsembleResult<PredictionShape> {
        let n = inputs[0].nrows();
        Ok(PredictionShape::PerFeatureSet(
            (0..self.n_sets)
                .map(|_| GaussianPrediction::constant(n, self.params[0], self.params[1]))
                .collect(),
        ))
    }

    fn fit_epoch(
        &mut self,
        _inputs: &[DMatrix<f64>],
        _target: &DVector<f64>,
        _batch_size: usize,
        _rng: &mut StdRng,
    ) -> EnsembleResult<f64> {
        Ok(0.0)
    }

    fn negative_log_likelihood(
        &self,
        _inputs: &[DMatrix<f64>],
        _target: &DVector<f64>,
    ) -> EnsembleResult<f64> {
        Ok(0.0)
    }

    fn weights(&self) -> ModelWeights {
        ModelWeights {
            architecture: "stored".to_string(),
            input_dims: Vec::new(),
            params: self.params.clone(),
        }
    }

    fn set_weights(&mut self, weights: &ModelWeights) -> EnsembleResult<()> {
        self.params = weights.params.clone();
        Ok(())
    }
}

struct StoredGaussianFactory;

impl ModelFactory for StoredGaussianFactory {
    fn build_model(
        &self,
        _config: &EnsembleConfig,
        input_dims: &[usize],
        _seed: u64,
    ) -> EnsembleResult<Box<dyn ProbabilisticModel>> {
        Ok(Box::new(StoredGaussian {
            n_sets: input_dims.len(),
            params: vec![0.0, 1.0],
        }))
    }
}

// =============================================================================
// Trainer: best-checkpoint selection
// =============================================================================

#[test]
fn test_trainer_keeps_best_validation_epoch() {
    let config = EnsembleConfig {
        epochs: 5,
        ..small_config()
    };
    let factory = ScriptedFactory {
        mean: 0.0,
        std_dev: 1.0,
        val_script: vec![3.0, 2.0, 1.5, 1.7, 1.6],
    };
    let store = MemoryModelStore::new();
    let pipeline = EnsemblePipeline::new(&config, &factory, &store);

    let data = synthetic_dataset(30, 1);
    let folds = plan_folds(&config, data.n_samples()).unwrap();
    let fold = FoldData::prepare(&data, &folds[0], &config).unwrap();

    let key = CheckpointKey::new(1, 0);
    let (model, report) = pipeline.train_member(key, &fold).unwrap();

    assert_eq!(report.best_epoch, 3);
    assert_relative_eq!(report.val_nll, 1.5);
    assert_relative_eq!(report.train_nll, 10.0 / 3.0);
    // returned model is the reloaded best epoch, not the last one
    assert_eq!(model.weights().params, vec![3.0]);
    assert_eq!(store.get(key).unwrap().params, vec![3.0]);
}

#[test]
fn test_trainer_surfaces_nan_with_fold_and_member() {
    let config = EnsembleConfig {
        epochs: 3,
        ..small_config()
    };
    let factory = ScriptedFactory {
        mean: 0.0,
        std_dev: 1.0,
        val_script: vec![2.0, f64::NAN, 1.0],
    };
    let store = MemoryModelStore::new();
    let pipeline = EnsemblePipeline::new(&config, &factory, &store);

    let data = synthetic_dataset(30, 2);
    let folds = plan_folds(&config, data.n_samples()).unwrap();
    let fold = FoldData::prepare(&data, &folds[1], &config).unwrap();

    let err = pipeline
        .train_member(CheckpointKey::new(2, 1), &fold)
        .err()
        .unwrap();
    match err {
        EnsembleError::Numerical { fold, member, detail } => {
            assert_eq!(fold, 2);
            assert_eq!(member, Some(1));
            assert!(detail.contains("epoch 2"));
        }
        other => panic!("unexpected error: {other}"),
    }
    // only the pre-divergence epoch was ever persisted
    assert_eq!(store.get(CheckpointKey::new(2, 1)).unwrap().params, vec![1.0]);
}

// =============================================================================
// Aggregator: degenerate ensemble end to end
// =============================================================================

#[test]
fn test_identical_members_give_zero_rmse_and_standard_normal_nll() {
    let config = EnsembleConfig {
        n_models: 3,
        epochs: 1,
        ..small_config()
    };
    let factory = ScriptedFactory {
        mean: 5.0,
        std_dev: 1.0,
        val_script: vec![1.0],
    };
    let store = MemoryModelStore::new();
    let pipeline = EnsemblePipeline::new(&config, &factory, &store);

    let x0 = DMatrix::from_fn(9, 2, |r, c| (r + c) as f64);
    let x1 = DMatrix::from_fn(9, 1, |r, _| (r * r) as f64);
    let data = Dataset::new(vec![x0, x1], DVector::from_element(9, 5.0)).unwrap();
    let summary = pipeline.run_cross_validation(&data, Mode::Train).unwrap();

    assert_eq!(summary.folds.len(), 3);
    assert_eq!(store.len(), 9);
    assert_relative_eq!(summary.rmse.mean, 0.0);
    let half_ln_two_pi = 0.5 * (2.0 * std::f64::consts::PI).ln();
    assert_eq!(summary.nll.len(), 2);
    for nll in &summary.nll {
        assert_relative_eq!(nll.mean, half_ln_two_pi, epsilon = 1e-12);
        assert_relative_eq!(nll.std, 0.0, epsilon = 1e-12);
    }
}

// =============================================================================
// Cross-validation + collection with the built-in model
// =============================================================================

fn train_then_evaluate(variant: ModelVariant, decomposition: VarianceDecomposition) {
    let config = EnsembleConfig {
        build_model: variant,
        variance_decomposition: decomposition,
        ..small_config()
    };
    let factory = GaussianHeadsFactory;
    let store = MemoryModelStore::new();
    let pipeline = EnsemblePipeline::new(&config, &factory, &store);
    let data = synthetic_dataset(60, 7);

    let trained = pipeline.run_cross_validation(&data, Mode::Train).unwrap();
    assert_eq!(store.len(), config.n_folds * config.n_models);
    assert!(trained.rmse.mean.is_finite());
    for fold in &trained.folds {
        assert_eq!(fold.members.len(), 2);
        assert!(fold.members.iter().all(|m| m.training.is_some()));
    }

    let evaluated = pipeline.run_cross_validation(&data, Mode::Evaluate).unwrap();
    for (t, e) in trained.folds.iter().zip(&evaluated.folds) {
        assert_eq!(t.fold, e.fold);
        assert_relative_eq!(t.rmse, e.rmse, epsilon = 1e-12);
        for (tn, en) in t.nll.iter().zip(&e.nll) {
            assert_relative_eq!(*tn, *en, epsilon = 1e-12);
        }
        assert!(e.members.iter().all(|m| m.training.is_none()));
    }

    let collected = pipeline.collect_predictions(&data).unwrap();
    assert_eq!(collected.n_samples(), 60);
    assert_eq!(collected.n_feature_sets(), 2);
    let mut seen = collected.sample_indices.clone();
    seen.sort_unstable();
    assert_eq!(seen, (0..60).collect::<Vec<_>>());
    for (r, &i) in collected.sample_indices.iter().enumerate() {
        assert_eq!(collected.true_values[r], data.target()[i]);
    }

    let curves = analyze_feature_sets(&collected).unwrap();
    assert_eq!(curves.len(), 2);
    assert_eq!(curves[0].non_deferred_rmse.len(), 61);
    assert_eq!(curves[1].non_deferred_rmse[60], 0.0);
}

#[test]
fn test_independent_heads_evaluation_reproduces_training() {
    train_then_evaluate(ModelVariant::IndependentHeads, VarianceDecomposition::EnsembleMean);
}

#[test]
fn test_multivariate_evaluation_reproduces_training() {
    train_then_evaluate(ModelVariant::Multivariate, VarianceDecomposition::MemberMeans);
}

#[test]
fn test_evaluate_without_checkpoints_names_fold_and_member() {
    let config = small_config();
    let factory = GaussianHeadsFactory;
    let store = MemoryModelStore::new();
    let pipeline = EnsemblePipeline::new(&config, &factory, &store);

    let err = pipeline
        .run_cross_validation(&synthetic_dataset(30, 3), Mode::Evaluate)
        .unwrap_err();
    assert!(matches!(err, EnsembleError::Checkpoint { fold: 1, .. }));
}

#[test]
fn test_missing_member_aborts_collection() {
    let config = EnsembleConfig {
        n_models: 3,
        epochs: 2,
        ..small_config()
    };
    let factory = GaussianHeadsFactory;
    let full = MemoryModelStore::new();
    let data = synthetic_dataset(30, 4);
    EnsemblePipeline::new(&config, &factory, &full)
        .run_cross_validation(&data, Mode::Train)
        .unwrap();

    // copy everything except fold 2, member 2
    let partial = MemoryModelStore::new();
    for fold in 1..=3 {
        for member in 0..3 {
            let key = CheckpointKey::new(fold, member);
            if key != CheckpointKey::new(2, 2) {
                partial.put(key, &full.get(key).unwrap()).unwrap();
            }
        }
    }

    let err = EnsemblePipeline::new(&config, &factory, &partial)
        .collect_predictions(&data)
        .unwrap_err();
    assert!(matches!(err, EnsembleError::Checkpoint { fold: 2, member: 2, .. }));
}

#[test]
fn test_feature_set_count_must_match_config() {
    let config = EnsembleConfig {
        n_feature_sets: Some(3),
        ..small_config()
    };
    let factory = GaussianHeadsFactory;
    let store = MemoryModelStore::new();
    let err = EnsemblePipeline::new(&config, &factory, &store)
        .run_cross_validation(&synthetic_dataset(30, 5), Mode::Train)
        .unwrap_err();
    assert!(matches!(err, EnsembleError::ShapeMismatch(_)));
    assert!(store.is_empty());
}

#[test]
fn test_checkpoint_for_other_architecture_is_rejected() {
    let config = EnsembleConfig {
        epochs: 2,
        ..small_config()
    };
    let factory = GaussianHeadsFactory;
    let store = MemoryModelStore::new();
    let data = synthetic_dataset(30, 6);
    EnsemblePipeline::new(&config, &factory, &store)
        .run_cross_validation(&data, Mode::Train)
        .unwrap();

    let other = EnsembleConfig {
        build_model: ModelVariant::Multivariate,
        ..config
    };
    let err = EnsemblePipeline::new(&other, &factory, &store)
        .run_cross_validation(&data, Mode::Evaluate)
        .unwrap_err();
    assert!(matches!(err, EnsembleError::Checkpoint { .. }));
}

// =============================================================================
// Collector: spread includes member disagreement
// =============================================================================

#[test]
fn test_collector_spread_includes_member_disagreement() {
    // driver keeps the default decomposition
    let config = EnsembleConfig {
        n_folds: 2,
        n_models: 2,
        ..small_config()
    };
    assert_eq!(config.variance_decomposition, VarianceDecomposition::EnsembleMean);

    let store = MemoryModelStore::new();
    for fold in 1..=2 {
        for (member, params) in [(0, vec![4.0, 1.0]), (1, vec![6.0, 2.0])] {
            let weights = ModelWeights {
                architecture: "stored".to_string(),
                input_dims: Vec::new(),
                params,
            };
            store.put(CheckpointKey::new(fold, member), &weights).unwrap();
        }
    }
    let factory = StoredGaussianFactory;
    let pipeline = EnsemblePipeline::new(&config, &factory, &store);
    let data = synthetic_dataset(12, 8);

    let collected = pipeline.collect_predictions(&data).unwrap();
    assert_eq!(collected.n_samples(), 12);
    for r in 0..12 {
        assert_relative_eq!(collected.means[r], 5.0);
        for i in 0..2 {
            // aleatoric (1 + 4) / 2 plus epistemic ((4-5)^2 + (6-5)^2) / 2
            assert_relative_eq!(collected.std_devs[(r, i)], 3.5_f64.sqrt(), epsilon = 1e-12);
        }
    }

    // the cross-validation path still honours the configured decomposition
    let folds = plan_folds(&config, data.n_samples()).unwrap();
    let fold = FoldData::prepare(&data, &folds[0], &config).unwrap();
    let evaluation = pipeline.evaluate_ensemble(&fold, Mode::Evaluate).unwrap();
    assert_relative_eq!(evaluation.prediction.std_dev[(0, 0)], 2.5_f64.sqrt(), epsilon = 1e-12);
    assert_relative_eq!(evaluation.prediction.epistemic_variance[(0, 1)], 0.0);
}
