pub mod aggregator;
pub mod cross_validation;
pub mod deferral;
pub mod folds;
pub mod gaussian_model;
pub mod metrics;
pub mod pipeline;
pub mod predictions;
pub mod scaler;
pub mod store;
pub mod trainer;

#[cfg(test)]
mod tests;

pub use aggregator::{combine_members, FoldEvaluation, MemberSummary, Mode};
pub use cross_validation::{CrossValidationSummary, FoldResult};
pub use deferral::{analyze as analyze_deferral, analyze_feature_sets, DeferralCurves};
pub use folds::{plan_folds, Fold, FoldData};
pub use gaussian_model::{GaussianHeadsFactory, LinearGaussianModel};
pub use metrics::MeanStd;
pub use pipeline::EnsemblePipeline;
pub use predictions::CollectedPredictions;
pub use scaler::StandardScaler;
pub use store::{FileModelStore, MemoryModelStore};
pub use trainer::TrainingReport;
