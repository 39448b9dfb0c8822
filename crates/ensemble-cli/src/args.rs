//! Command-line parsing. Flags override the `ENSEMBLE_*` environment.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use ensemble_core::EnsembleConfig;

pub const USAGE: &str = "\
Usage: deep-ensemble <train|evaluate|plot> --data <dataset.json> [options]

Options:
  --folds <n>          number of cross-validation folds
  --models <n>         ensemble size per fold
  --feature-sets <n>   expected feature-set count
  --epochs <n>         training epochs per member
  --batch-size <n>     mini-batch size
  --lr <f>             learning rate
  --model-dir <path>   checkpoint directory
  --dataset <name>     dataset name ('msd' selects the fixed split)
  --build-model <v>    combined_pog | combined_multivariate
  --plot-name <path>   deferral report output
  --verbose <0|1|2>    per-sample logging level
  --seed <n>           fold shuffling and initialisation seed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Train,
    Evaluate,
    Plot,
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "train" => Ok(Self::Train),
            "evaluate" => Ok(Self::Evaluate),
            "plot" => Ok(Self::Plot),
            other => Err(anyhow!("unknown command '{other}'")),
        }
    }
}

#[derive(Debug)]
pub struct CliArgs {
    pub command: Command,
    pub data: PathBuf,
}

fn flag<T>(args: &[String], name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(i) = args.iter().position(|a| a == name) else {
        return Ok(None);
    };
    let raw = args
        .get(i + 1)
        .ok_or_else(|| anyhow!("{name} needs a value"))?;
    raw.parse()
        .map(Some)
        .map_err(|e| anyhow!("{name} '{raw}': {e}"))
}

/// Parse `args` (without the program name) and apply overrides to `config`.
pub fn parse(args: &[String], config: &mut EnsembleConfig) -> Result<CliArgs> {
    let command: Command = args
        .first()
        .ok_or_else(|| anyhow!("missing command"))?
        .parse()?;
    let data: PathBuf = flag(args, "--data")?.context("--data is required")?;

    if let Some(v) = flag(args, "--folds")? {
        config.n_folds = v;
    }
    if let Some(v) = flag(args, "--models")? {
        config.n_models = v;
    }
    if let Some(v) = flag(args, "--feature-sets")? {
        config.n_feature_sets = Some(v);
    }
    if let Some(v) = flag(args, "--epochs")? {
        config.epochs = v;
    }
    if let Some(v) = flag(args, "--batch-size")? {
        config.batch_size = v;
    }
    if let Some(v) = flag(args, "--lr")? {
        config.lr = v;
    }
    if let Some(v) = flag(args, "--model-dir")? {
        config.model_dir = v;
    }
    if let Some(v) = flag(args, "--dataset")? {
        config.dataset = v;
    }
    if let Some(v) = flag(args, "--build-model")? {
        config.build_model = v;
    }
    if let Some(v) = flag(args, "--plot-name")? {
        config.plot_name = v;
    }
    if let Some(v) = flag(args, "--verbose")? {
        config.verbose = v;
    }
    if let Some(v) = flag(args, "--seed")? {
        config.seed = v;
    }

    config.validate()?;

    Ok(CliArgs { command, data })
}
