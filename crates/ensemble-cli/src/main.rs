//! deep-ensemble: train, evaluate and analyse a cross-validated deep ensemble.
//!
//! Usage:
//!   deep-ensemble train --data dataset.json --folds 5 --models 5
//!   deep-ensemble evaluate --data dataset.json
//!   deep-ensemble plot --data dataset.json --plot-name deferral.json

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use deep_ensemble::{
    analyze_feature_sets, DeferralCurves, EnsemblePipeline, FileModelStore, GaussianHeadsFactory,
    Mode,
};
use ensemble_core::{Dataset, EnsembleConfig};
use serde::Serialize;

mod args;

use args::{Command, USAGE};

/// Written to `plot_name` by the `plot` command.
#[derive(Debug, Serialize)]
struct DeferralReport<'a> {
    generated_at: DateTime<Utc>,
    dataset: &'a str,
    build_model: String,
    n_samples: usize,
    /// Indexed by feature set.
    curves: Vec<DeferralCurves>,
}

fn init_tracing() {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "deep_ensemble=info,ensemble_cli=info".into())
    };
    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt().json().with_env_filter(filter()).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter()).init();
    }
}

fn load_dataset(path: &Path) -> Result<Dataset> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let dataset = Dataset::from_json_reader(BufReader::new(file))
        .with_context(|| format!("reading dataset {}", path.display()))?;
    tracing::info!(
        "Loaded {} samples across {} feature sets (dims {:?})",
        dataset.n_samples(),
        dataset.n_feature_sets(),
        dataset.input_dims()
    );
    Ok(dataset)
}

fn write_report(config: &EnsembleConfig, n_samples: usize, curves: Vec<DeferralCurves>) -> Result<()> {
    let report = DeferralReport {
        generated_at: Utc::now(),
        dataset: &config.dataset,
        build_model: config.build_model.to_string(),
        n_samples,
        curves,
    };
    let path = &config.plot_name;
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), &report)
        .with_context(|| format!("writing {}", path.display()))?;
    tracing::info!("Deferral report written to {}", path.display());
    Ok(())
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let argv: Vec<String> = std::env::args().skip(1).collect();
    if argv.is_empty() || argv.iter().any(|a| a == "--help" || a == "-h") {
        println!("{USAGE}");
        return Ok(());
    }

    let mut config = EnsembleConfig::from_env().context("loading ENSEMBLE_* configuration")?;
    let cli = args::parse(&argv, &mut config)?;
    tracing::info!(
        "{:?}: {} folds x {} models, build_model={}, model_dir={}",
        cli.command,
        config.n_folds,
        config.n_models,
        config.build_model,
        config.model_dir.display()
    );

    let dataset = load_dataset(&cli.data)?;
    let store = FileModelStore::new(&config.model_dir)
        .with_context(|| format!("opening model dir {}", config.model_dir.display()))?;
    let factory = GaussianHeadsFactory;
    let pipeline = EnsemblePipeline::new(&config, &factory, &store);

    match cli.command {
        Command::Train => {
            pipeline
                .run_cross_validation(&dataset, Mode::Train)
                .context("training failed")?;
        }
        Command::Evaluate => {
            pipeline
                .run_cross_validation(&dataset, Mode::Evaluate)
                .context("evaluation failed")?;
        }
        Command::Plot => {
            let collected = pipeline
                .collect_predictions(&dataset)
                .context("collecting out-of-fold predictions")?;
            let curves = analyze_feature_sets(&collected)?;
            write_report(&config, collected.n_samples(), curves)?;
        }
    }

    Ok(())
}
