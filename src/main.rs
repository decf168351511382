//! `psp` - train and evaluate per-date PV site models.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};

use pv_site_prediction::config::ExpConfig;
use pv_site_prediction::dataset::SplitName;
use pv_site_prediction::run::{run_eval, run_train, EvalOptions, TrainOptions};
use pv_site_prediction::telemetry::{self, StopFlag};

#[derive(Parser, Debug)]
#[command(name = "psp", version, about = "PV site prediction experiments")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Directory containing all experiments
    #[arg(long, global = true, env = "PSP_EXP_ROOT", default_value = "exp")]
    exp_root: PathBuf,

    /// Experiment name; `<exp_root>/<exp_name>/config.toml` is read if present
    #[arg(long, short = 'n', global = true, env = "PSP_EXP_NAME", default_value = "default")]
    exp_name: String,

    /// Sample worker threads (overrides `runtime.num_workers`)
    #[arg(long, short = 'w', global = true)]
    num_workers: Option<usize>,

    #[arg(long, global = true, env = "PSP_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train the model for one cutoff date
    Train(TrainArgs),
    /// Evaluate all trained models on a split
    Eval(EvalArgs),
}

#[derive(Args, Debug)]
struct TrainArgs {
    #[arg(long, short = 'b')]
    batch_size: Option<usize>,

    /// Index into `dates.train_dates`
    #[arg(long, short = 'i', default_value = "0")]
    cutoff_index: usize,
}

#[derive(Args, Debug)]
struct EvalArgs {
    /// Maximum number of samples
    #[arg(long, short = 'l')]
    limit: Option<usize>,

    #[arg(long, short = 's', default_value = "test")]
    split: SplitName,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ExpConfig::load(&cli.global.exp_root, &cli.global.exp_name)?;
    telemetry::init_tracing(&cli.global.log_level, cli.global.log_json || config.runtime.log_json);

    let exp_dir = ExpConfig::exp_dir(&cli.global.exp_root, &cli.global.exp_name);
    let num_workers = cli.global.num_workers.unwrap_or(config.runtime.num_workers);
    info!(exp_dir = %exp_dir.display(), num_workers, "starting psp");

    let stop = StopFlag::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            telemetry::shutdown_signal().await;
            warn!("stop requested, finishing current work");
            stop.stop();
        });
    }

    let command = cli.command;
    tokio::task::spawn_blocking(move || -> Result<()> {
        let source = config.open_data_source()?;
        match command {
            Commands::Train(args) => {
                let options = TrainOptions {
                    exp_dir,
                    cutoff_index: args.cutoff_index,
                    batch_size: args.batch_size,
                    num_workers,
                };
                let summary = run_train(&config, source, &options, &stop)?;
                let report = serde_json::to_string(&summary.report)?;
                info!(
                    path = %summary.model_path.display(),
                    cutoff = %summary.cutoff,
                    %report,
                    "model trained"
                );
            }
            Commands::Eval(args) => {
                let options = EvalOptions {
                    exp_dir,
                    split: args.split,
                    limit: args.limit,
                    num_workers,
                };
                let summary = run_eval(&config, source, &options, &stop)?;
                if summary.interrupted {
                    warn!(path = %summary.errors_path.display(), "partial results written");
                } else {
                    info!(path = %summary.errors_path.display(), "results written");
                }
            }
        }
        Ok(())
    })
    .await
    .context("run task failed")??;

    info!("psp finished");
    Ok(())
}
