//! Training run: fit one model on the data available up to a cutoff date.

use anyhow::{ensure, Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use super::model_path;
use crate::config::ExpConfig;
use crate::data::{DataSources, PvDataSource};
use crate::dataset::{pv_list_to_short_str, split_train_test, Sample, SampleGenerator};
use crate::domain::Timestamp;
use crate::error::PspError;
use crate::ml::models::RecentHistoryModel;
use crate::ml::{save_model, BatchIter, GetFeatures, PvSiteModel, TrainablePvSiteModel, TrainingReport};
use crate::telemetry::StopFlag;

#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub exp_dir: PathBuf,
    /// Index into `dates.train_dates`.
    pub cutoff_index: usize,
    /// Overrides `training.batch_size`.
    pub batch_size: Option<usize>,
    pub num_workers: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainSummary {
    pub model_path: PathBuf,
    pub cutoff: Timestamp,
    pub report: TrainingReport,
}

pub fn run_train(
    config: &ExpConfig,
    source: Arc<dyn PvDataSource>,
    options: &TrainOptions,
    stop: &StopFlag,
) -> Result<TrainSummary> {
    let batch_size = options.batch_size.unwrap_or(config.training.batch_size);
    ensure!(batch_size > 0, "batch size must be at least 1");
    ensure!(
        config.training.valid_limit % batch_size == 0,
        "validation limit {} must be a multiple of the batch size {batch_size}",
        config.training.valid_limit
    );

    let horizons = config.horizons()?;
    let splits = split_train_test(source.as_ref(), &config.splits).context("failed to split sites")?;
    info!(
        train = %pv_list_to_short_str(&splits.train),
        valid = %pv_list_to_short_str(&splits.valid),
        "site splits"
    );

    let cutoff = config.dates.cutoff(options.cutoff_index)?;
    let (train_start, _) = config.dates.train_window(options.cutoff_index)?;
    // Targets must be observed by the cutoff.
    let last_ts = cutoff - horizons.span();
    ensure!(
        train_start <= last_ts,
        "training window of {} days is shorter than the forecast span",
        config.dates.num_train_days
    );

    let mut model = RecentHistoryModel::new(horizons.clone(), config.model.history.clone()).with_cutoff(cutoff);
    model.set_data_sources(&DataSources::new(Arc::clone(&source)));
    let features: Arc<dyn GetFeatures> = Arc::new(model.feature_extractor()?);

    let generator = SampleGenerator::new(Arc::clone(&source), horizons, features)
        .with_workers(options.num_workers)
        .with_stop(stop.clone());

    let mut train = generator
        .generate(&splits.train, train_start, last_ts, &config.train_policy())?
        .batches(batch_size)?;
    let mut valid: Box<BatchIter<'static>> = if splits.valid.is_empty() {
        warn!("no validation sites, skipping validation");
        Box::new(std::iter::empty::<crate::error::Result<Vec<Sample>>>())
    } else {
        Box::new(
            generator
                .generate(&splits.valid, train_start, last_ts, &config.valid_policy())?
                .batches(batch_size)?,
        )
    };

    info!(%cutoff, %train_start, %last_ts, batch_size, "training model");
    let trained = model.train(&mut train, valid.as_mut());

    if stop.is_stopped() {
        let completed = trained.as_ref().map_or(0, |r| r.train_samples);
        warn!(samples = completed, "training interrupted, model not saved");
        return Err(PspError::Interrupted { completed }.into());
    }
    let report = trained.with_context(|| format!("training model {} failed", options.cutoff_index))?;

    let path = model_path(&options.exp_dir, options.cutoff_index);
    save_model(&model, &path).with_context(|| format!("failed to save model to {}", path.display()))?;

    Ok(TrainSummary {
        model_path: path,
        cutoff,
        report,
    })
}
