//! Experiment configuration
//!
//! Layered with figment: built-in defaults, then `<exp_root>/<exp_name>/config.toml`,
//! then `PSP__`-prefixed environment variables (`PSP__SAMPLING__STEP_MINUTES=30`).

use anyhow::{bail, Context, Result};
use chrono::Duration;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use validator::Validate;

use crate::data::{resolve_units, InMemoryPvDataSource, PowerUnit, PvDataSource, ScaledPvDataSource};
use crate::dataset::{DateSplits, SamplingPolicy, SplitConfig};
use crate::domain::Horizons;
use crate::forecast::{metric_from_name, Metric};
use crate::ml::models::RecentHistoryConfig;
use crate::ml::{DispatchPolicy, FallbackPolicy};

pub const CONFIG_FILE: &str = "config.toml";
pub const ENV_PREFIX: &str = "PSP__";

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct ExpConfig {
    #[validate(nested)]
    pub data: DataConfig,
    #[validate(nested)]
    pub model: ModelConfig,
    #[validate(nested)]
    pub splits: SplitConfig,
    #[validate(nested)]
    pub dates: DateSplits,
    #[validate(nested)]
    pub sampling: SamplingConfig,
    #[validate(nested)]
    pub dispatch: DispatchConfig,
    #[validate(nested)]
    pub training: TrainingConfig,
    #[validate(nested)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DataConfig {
    /// CSV with `pv_id,ts,power[,capacity]` columns.
    pub path: PathBuf,
    pub series_unit: PowerUnit,
    pub metadata_unit: PowerUnit,
    /// Unit both sides are converted to. Required when they differ.
    pub target_unit: Option<PowerUnit>,
    #[validate(range(exclusive_min = 0.0))]
    pub power_conversion_factor: f64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/pv.csv"),
            series_unit: PowerUnit::KW,
            metadata_unit: PowerUnit::KW,
            target_unit: None,
            power_conversion_factor: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ModelConfig {
    #[validate(range(min = 1))]
    pub horizon_minutes: i64,
    #[validate(range(min = 1))]
    pub num_horizons: usize,
    pub history: RecentHistoryConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            horizon_minutes: 30,
            num_horizons: 48,
            history: RecentHistoryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SamplingConfig {
    #[validate(range(min = 1))]
    pub step_minutes: i64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub prob_keep_sample: f64,
    pub train_limit: Option<usize>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            step_minutes: 15,
            prob_keep_sample: 1.0,
            train_limit: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DispatchConfig {
    #[validate(range(min = 0))]
    pub min_lead_hours: i64,
    #[validate(range(min = 1))]
    pub max_model_age_days: Option<i64>,
    pub fallback: FallbackPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            min_lead_hours: 24,
            max_model_age_days: None,
            fallback: FallbackPolicy::Error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TrainingConfig {
    pub train_seed: u64,
    pub valid_seed: u64,
    #[validate(range(min = 1))]
    pub valid_limit: usize,
    #[validate(range(min = 1))]
    pub batch_size: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            train_seed: 1234,
            valid_seed: 4321,
            valid_limit: 128,
            batch_size: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EvaluationConfig {
    pub seed: u64,
    pub shuffle: bool,
    #[validate(range(min = 1))]
    pub limit: usize,
    #[validate(length(min = 1))]
    pub metrics: Vec<String>,
    #[validate(range(exclusive_min = 0.0))]
    pub mre_cap: f64,
    /// How far back to look for the latest capacity value.
    #[validate(range(min = 1))]
    pub capacity_lookback_days: i64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            seed: 1234,
            shuffle: true,
            limit: 1000,
            metrics: vec!["mae".to_string()],
            mre_cap: 0.1,
            capacity_lookback_days: 7,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Sample worker threads; 0 builds samples on the calling thread.
    pub num_workers: usize,
    pub log_json: bool,
}

impl ExpConfig {
    /// Directory holding the config, models and outputs of one experiment.
    pub fn exp_dir(exp_root: &Path, exp_name: &str) -> PathBuf {
        exp_root.join(exp_name)
    }

    pub fn load(exp_root: &Path, exp_name: &str) -> Result<Self> {
        let path = Self::exp_dir(exp_root, exp_name).join(CONFIG_FILE);
        let figment = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        let config: Self = figment
            .extract()
            .with_context(|| format!("invalid configuration for experiment {exp_name}"))?;
        config.check()?;
        info!(path = %path.display(), exists = path.exists(), "loaded experiment config");
        Ok(config)
    }

    /// Field ranges plus the cross-field rules.
    pub fn check(&self) -> Result<()> {
        self.validate().context("configuration validation failed")?;
        if self.splits.valid_fraction + self.splits.test_fraction >= 1.0 {
            bail!(
                "splits.valid_fraction + splits.test_fraction must be below 1, got {}",
                self.splits.valid_fraction + self.splits.test_fraction
            );
        }
        if self.training.valid_limit % self.training.batch_size != 0 {
            bail!(
                "training.valid_limit ({}) must be a multiple of training.batch_size ({})",
                self.training.valid_limit,
                self.training.batch_size
            );
        }
        if self.model.history.history_days < 1 {
            bail!("model.history.history_days must be at least 1");
        }
        if self.model.history.lag_minutes < 0 {
            bail!("model.history.lag_minutes must not be negative");
        }
        self.metrics()?;
        Ok(())
    }

    pub fn horizons(&self) -> Result<Horizons> {
        Ok(Horizons::uniform(self.model.horizon_minutes, self.model.num_horizons)?)
    }

    pub fn dispatch_policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            min_lead: Duration::hours(self.dispatch.min_lead_hours),
            max_model_age: self.dispatch.max_model_age_days.map(Duration::days),
            fallback: self.dispatch.fallback,
        }
    }

    pub fn train_policy(&self) -> SamplingPolicy {
        SamplingPolicy {
            step: Duration::minutes(self.sampling.step_minutes),
            prob_keep_sample: self.sampling.prob_keep_sample,
            limit: self.sampling.train_limit,
            shuffle: true,
            seed: self.training.train_seed,
        }
    }

    pub fn valid_policy(&self) -> SamplingPolicy {
        SamplingPolicy {
            step: Duration::minutes(self.sampling.step_minutes),
            prob_keep_sample: self.sampling.prob_keep_sample,
            limit: Some(self.training.valid_limit),
            shuffle: true,
            seed: self.training.valid_seed,
        }
    }

    pub fn eval_policy(&self, limit: Option<usize>) -> SamplingPolicy {
        SamplingPolicy {
            step: Duration::minutes(self.sampling.step_minutes),
            prob_keep_sample: 1.0,
            limit: Some(limit.unwrap_or(self.evaluation.limit)),
            shuffle: self.evaluation.shuffle,
            seed: self.evaluation.seed,
        }
    }

    pub fn metrics(&self) -> Result<Vec<Box<dyn Metric>>> {
        self.evaluation
            .metrics
            .iter()
            .map(|name| Ok(metric_from_name(name, self.evaluation.mre_cap)?))
            .collect()
    }

    /// Load the PV data and bring series and capacity into the same unit.
    pub fn open_data_source(&self) -> Result<Arc<dyn PvDataSource>> {
        let conversion = resolve_units(
            self.data.series_unit,
            self.data.metadata_unit,
            self.data.target_unit,
            self.data.power_conversion_factor,
        )?;
        let source = InMemoryPvDataSource::from_csv(&self.data.path)
            .with_context(|| format!("failed to read PV data from {}", self.data.path.display()))?;
        let source: Arc<dyn PvDataSource> = Arc::new(source);
        if conversion.is_identity() {
            return Ok(source);
        }
        info!(
            power_factor = conversion.power_factor,
            capacity_factor = conversion.capacity_factor,
            "converting power units"
        );
        Ok(Arc::new(ScaledPvDataSource::new(source, conversion)))
    }
}
