//! Evaluation run: per-date models scored on a held-out split.

use anyhow::{bail, ensure, Context, Result};
use chrono::Duration;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::slice;
use std::sync::Arc;
use tracing::{info, warn};

use super::{errors_path, model_path, summary_path};
use crate::config::ExpConfig;
use crate::data::{DataSources, PvDataSource, CAPACITY};
use crate::dataset::{pv_list_to_short_str, split_train_test, SampleGenerator, SplitName};
use crate::domain::{PvX, Timestamp};
use crate::forecast::{ErrorTable, HorizonSummary};
use crate::ml::models::RecentHistoryModel;
use crate::ml::{load_model, GetFeatures, MultiPvSiteModel, PvSiteModel};
use crate::telemetry::StopFlag;

#[derive(Debug, Clone)]
pub struct EvalOptions {
    pub exp_dir: PathBuf,
    pub split: SplitName,
    /// Overrides `evaluation.limit`.
    pub limit: Option<usize>,
    pub num_workers: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalSummary {
    pub split: SplitName,
    pub samples: usize,
    pub skipped: usize,
    pub rows: usize,
    pub errors_path: PathBuf,
    /// The run was stopped early; the error file holds the rows up to that point.
    pub interrupted: bool,
    pub horizons: Vec<HorizonSummary>,
}

/// Load every trained `model_<i>.bin` of the experiment, keyed by cutoff.
pub fn load_models(config: &ExpConfig, options: &EvalOptions) -> Result<Vec<(Timestamp, Box<dyn PvSiteModel>)>> {
    let mut models: Vec<(Timestamp, Box<dyn PvSiteModel>)> = Vec::new();
    for (index, cutoff) in config.dates.cutoffs().into_iter().enumerate() {
        let path = model_path(&options.exp_dir, index);
        if !path.exists() {
            warn!(path = %path.display(), %cutoff, "no model trained for cutoff");
            continue;
        }
        let model: RecentHistoryModel =
            load_model(&path).with_context(|| format!("failed to load {}", path.display()))?;
        if let Some(trained_cutoff) = model.metadata.cutoff {
            ensure!(
                trained_cutoff == cutoff,
                "{} was trained up to {trained_cutoff}, expected {cutoff}",
                path.display()
            );
        }
        models.push((cutoff, Box::new(model)));
    }
    if models.is_empty() {
        bail!("no trained models found in {}", options.exp_dir.display());
    }
    Ok(models)
}

/// Latest capacity observed in `[ts - lookback, ts]`, falling back to site attributes.
fn capacity_at(source: &dyn PvDataSource, x: &PvX, lookback: Duration) -> Result<Option<f64>> {
    let series = source.get(slice::from_ref(&x.pv_id), x.ts - lookback, x.ts)?;
    Ok(series
        .last_value(CAPACITY)
        .or_else(|| source.site_attributes(&x.pv_id).and_then(|a| a.capacity)))
}

pub fn run_eval(
    config: &ExpConfig,
    source: Arc<dyn PvDataSource>,
    options: &EvalOptions,
    stop: &StopFlag,
) -> Result<EvalSummary> {
    let horizons = config.horizons()?;
    let splits = split_train_test(source.as_ref(), &config.splits).context("failed to split sites")?;
    let pv_ids = splits.get(options.split);
    ensure!(!pv_ids.is_empty(), "split {} has no sites", options.split);
    info!(split = %options.split, sites = %pv_list_to_short_str(pv_ids), "evaluating");

    let policy = config.dispatch_policy();
    let (start_ts, end_ts) = config.dates.test_window(policy.min_lead)?;
    let mut model = MultiPvSiteModel::new(load_models(config, options)?, policy)?;
    model.set_data_sources(&DataSources::new(Arc::clone(&source)));
    let coverage = model.coverage();
    info!(
        models = model.len(),
        %start_ts,
        %end_ts,
        covered_from = %coverage.start,
        covered_until = ?coverage.end,
        "test window"
    );
    model
        .check_window(start_ts, end_ts)
        .with_context(|| format!("models in {} do not cover the test window", options.exp_dir.display()))?;
    let model = Arc::new(model);

    let features: Arc<dyn GetFeatures> = model.clone();
    let generator = SampleGenerator::new(Arc::clone(&source), horizons.clone(), features)
        .with_workers(options.num_workers)
        .with_stop(stop.clone());
    let mut stream = generator.generate(pv_ids, start_ts, end_ts, &config.eval_policy(options.limit))?;

    let mut table = ErrorTable::new(horizons, config.metrics()?);
    let has_capacity = source.list_data_variables().contains(CAPACITY);
    let lookback = Duration::days(config.evaluation.capacity_lookback_days);

    for sample in stream.by_ref() {
        let sample = sample?;
        let pred = model.predict_from_features(&sample.x, &sample.features)?;
        let capacity = if has_capacity {
            capacity_at(source.as_ref(), &sample.x, lookback)?
        } else {
            None
        };
        table.push_sample(&sample.x, &sample.y, &pred, capacity)?;
    }

    let interrupted = stop.is_stopped();
    if interrupted {
        warn!(rows = table.len(), "evaluation interrupted, writing partial results");
    }

    let path = errors_path(&options.exp_dir, options.split);
    table
        .write_csv(&path)
        .with_context(|| format!("failed to write {}", path.display()))?;

    let stats = stream.stats();
    let summary = EvalSummary {
        split: options.split,
        samples: stats.kept,
        skipped: stats.skipped,
        rows: table.len(),
        errors_path: path,
        interrupted,
        horizons: table.summary(),
    };

    let summary_file = summary_path(&options.exp_dir, options.split);
    let json = serde_json::to_string_pretty(&summary)?;
    fs::write(&summary_file, json).with_context(|| format!("failed to write {}", summary_file.display()))?;

    info!(
        samples = summary.samples,
        skipped = summary.skipped,
        rows = summary.rows,
        interrupted,
        "evaluation finished"
    );
    Ok(summary)
}
