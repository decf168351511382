//! Recent History Model
//!
//! Baseline PV model. For every horizon the feature is the mean power observed
//! in the same time-of-day window over the previous days; the prediction is
//! that feature times a per-horizon scale fitted by least squares.
//!
//! Features only read data through a [`CausalView`](crate::data::CausalView),
//! so nothing after `ts - lag` is ever used.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::slice;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::{BatchIter, GetFeatures, PvSiteModel, PvSiteModelConfig, TrainablePvSiteModel, TrainingReport};
use crate::data::{without_future, DataSources, PvDataSource, POWER};
use crate::domain::{Horizons, PvX, PvY, Timestamp};
use crate::error::{PspError, Result};
use crate::forecast::metrics::{MeanAbsoluteError, Metric};
use crate::ml::{FeatureVector, ModelMetadata};

/// Tunables of the recent history model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentHistoryConfig {
    /// Days of history averaged per horizon.
    pub history_days: i64,
    /// Delay before an observation becomes available.
    pub lag_minutes: i64,
    /// Window before `ts` used for the "recent power" feature.
    pub recent_window_minutes: i64,
}

impl Default for RecentHistoryConfig {
    fn default() -> Self {
        Self {
            history_days: 7,
            lag_minutes: 0,
            recent_window_minutes: 60,
        }
    }
}

/// Feature extractor, detached from the trained parameters.
#[derive(Clone)]
pub struct RecentHistoryFeatures {
    horizons: Horizons,
    params: RecentHistoryConfig,
    source: Arc<dyn PvDataSource>,
}

impl RecentHistoryFeatures {
    pub fn feature_names(horizons: &Horizons) -> Vec<String> {
        (0..horizons.len())
            .map(|i| format!("h{i}_history_mean"))
            .chain(["recent_power".to_string(), "history_coverage".to_string()])
            .collect()
    }
}

impl GetFeatures for RecentHistoryFeatures {
    fn get_features(&self, x: &PvX) -> Result<FeatureVector> {
        let view = without_future(
            Arc::clone(&self.source),
            x.ts,
            Duration::minutes(self.params.lag_minutes),
        );
        let history_start = x.ts - Duration::days(self.params.history_days);
        let series = view.get(slice::from_ref(&x.pv_id), history_start, x.ts)?;

        let mut values = Vec::with_capacity(self.horizons.len() + 2);
        let mut covered = 0usize;
        for h in &self.horizons {
            let (sum, days) = (1..=self.params.history_days)
                .filter_map(|d| {
                    let shift = Duration::days(d);
                    // Windows never reach the observation at `ts` itself.
                    let end = (x.ts + h.end() - shift).min(x.ts);
                    series.mean_between(POWER, x.ts + h.start() - shift, end)
                })
                .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
            if days > 0 {
                covered += 1;
                values.push(sum / days as f64);
            } else {
                values.push(0.0);
            }
        }

        if covered == 0 {
            return Err(PspError::missing_data(&x.pv_id, x.ts, "no power history for any horizon"));
        }

        let recent_start = x.ts - Duration::minutes(self.params.recent_window_minutes);
        let recent = series.mean_between(POWER, recent_start, x.ts).unwrap_or(0.0);
        values.push(recent);
        values.push(covered as f64 / self.horizons.len() as f64);

        FeatureVector::new(values, Self::feature_names(&self.horizons))
    }
}

/// Trained recent history model.
#[derive(Clone, Serialize, Deserialize)]
pub struct RecentHistoryModel {
    pub metadata: ModelMetadata,
    config: PvSiteModelConfig,
    pub params: RecentHistoryConfig,
    /// Per-horizon multiplier applied to the history feature.
    pub scales: Vec<f64>,
    #[serde(skip)]
    source: Option<Arc<dyn PvDataSource>>,
}

impl RecentHistoryModel {
    pub fn new(horizons: Horizons, params: RecentHistoryConfig) -> Self {
        let metadata = ModelMetadata {
            model_id: format!("recent_history_{}", Uuid::new_v4()),
            version: env!("CARGO_PKG_VERSION").to_string(),
            trained_at: None,
            cutoff: None,
            training_samples: 0,
            validation_mae: None,
            feature_names: RecentHistoryFeatures::feature_names(&horizons),
        };
        Self {
            metadata,
            scales: vec![1.0; horizons.len()],
            config: PvSiteModelConfig { horizons },
            params,
            source: None,
        }
    }

    /// Record the training cutoff of this instance.
    pub fn with_cutoff(mut self, cutoff: Timestamp) -> Self {
        self.metadata.cutoff = Some(cutoff);
        self
    }

    /// Shareable feature extractor, usable from sample worker threads.
    pub fn feature_extractor(&self) -> Result<RecentHistoryFeatures> {
        let source = self
            .source
            .clone()
            .ok_or_else(|| PspError::Model("data sources not set".into()))?;
        Ok(RecentHistoryFeatures {
            horizons: self.config.horizons.clone(),
            params: self.params.clone(),
            source,
        })
    }

    fn check_features(&self, features: &FeatureVector) -> Result<()> {
        let expected = self.config.horizons.len() + 2;
        if features.len() != expected {
            return Err(PspError::Model(format!(
                "Feature count mismatch: expected {expected}, got {}",
                features.len()
            )));
        }
        Ok(())
    }
}

impl GetFeatures for RecentHistoryModel {
    fn get_features(&self, x: &PvX) -> Result<FeatureVector> {
        self.feature_extractor()?.get_features(x)
    }
}

impl PvSiteModel for RecentHistoryModel {
    fn config(&self) -> &PvSiteModelConfig {
        &self.config
    }

    fn predict_from_features(&self, _x: &PvX, features: &FeatureVector) -> Result<PvY> {
        self.check_features(features)?;
        let powers = self
            .scales
            .iter()
            .zip(&features.features)
            .map(|(scale, f)| (scale * f).max(0.0))
            .collect();
        Ok(PvY::new(powers))
    }

    fn set_data_sources(&mut self, sources: &DataSources) {
        self.source = Some(Arc::clone(&sources.pv));
    }
}

impl TrainablePvSiteModel for RecentHistoryModel {
    fn train(&mut self, train: &mut BatchIter<'_>, valid: &mut BatchIter<'_>) -> Result<TrainingReport> {
        let n_horizons = self.config.horizons.len();
        let mut num = vec![0.0; n_horizons];
        let mut den = vec![0.0; n_horizons];
        let mut train_samples = 0usize;

        for batch in train {
            for sample in batch? {
                self.check_features(&sample.features)?;
                for i in 0..n_horizons {
                    let f = sample.features.features[i];
                    num[i] += f * sample.y.powers[i];
                    den[i] += f * f;
                }
                train_samples += 1;
            }
        }
        if train_samples == 0 {
            return Err(PspError::Model("no training samples".into()));
        }

        self.scales = num
            .iter()
            .zip(&den)
            .map(|(n, d)| if *d > 1e-12 { n / d } else { 1.0 })
            .collect();

        let metric = MeanAbsoluteError;
        let mut valid_samples = 0usize;
        let mut error_sum = 0.0;
        let mut error_count = 0usize;
        for batch in valid {
            for sample in batch? {
                let pred = self.predict_from_features(&sample.x, &sample.features)?;
                let errors = metric.compute(&sample.y, &pred)?;
                error_sum += errors.iter().sum::<f64>();
                error_count += errors.len();
                valid_samples += 1;
            }
        }
        let valid_mae = (error_count > 0).then(|| error_sum / error_count as f64);

        self.metadata.trained_at = Some(Utc::now());
        self.metadata.training_samples = train_samples;
        self.metadata.validation_mae = valid_mae;

        info!(
            model_id = %self.metadata.model_id,
            train_samples,
            valid_samples,
            valid_mae = ?valid_mae,
            "training finished"
        );

        Ok(TrainingReport {
            train_samples,
            valid_samples,
            valid_mae,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::InMemoryPvDataSource;
    use crate::dataset::Sample;
    use crate::domain::PvId;
    use chrono::TimeZone;

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2021, 6, 10, 12, 0, 0).unwrap()
    }

    /// Three days of constant power 2.0 before `t0`, then 4.0 from `t0` on.
    fn model() -> RecentHistoryModel {
        let mut s = InMemoryPvDataSource::new();
        let start = t0() - Duration::days(3);
        for i in 0..(4 * 24 * 4) {
            let ts = start + Duration::minutes(15 * i);
            let p = if ts < t0() { 2.0 } else { 4.0 };
            s.insert_power(PvId::from("a"), ts, p);
        }
        let mut m = RecentHistoryModel::new(Horizons::uniform(60, 3).unwrap(), RecentHistoryConfig::default());
        m.set_data_sources(&DataSources::new(Arc::new(s)));
        m
    }

    #[test]
    fn test_features_never_see_future() {
        let m = model();
        let f = m.get_features(&PvX::new(PvId::from("a"), t0())).unwrap();
        assert_eq!(f.len(), 5);
        // Only the 2.0 history is visible even though the target window holds 4.0.
        assert_eq!(&f.features[..3], &[2.0, 2.0, 2.0]);
        assert_eq!(f.get("recent_power"), Some(2.0));
        assert_eq!(f.get("history_coverage"), Some(1.0));
    }

    #[test]
    fn test_no_history_is_missing_data() {
        let m = model();
        let x = PvX::new(PvId::from("a"), t0() - Duration::days(10));
        assert!(matches!(m.get_features(&x), Err(PspError::MissingData { .. })));
    }

    #[test]
    fn test_unset_source_is_an_error() {
        let m = RecentHistoryModel::new(Horizons::uniform(60, 1).unwrap(), RecentHistoryConfig::default());
        assert!(m.feature_extractor().is_err());
    }

    #[test]
    fn test_train_fits_scale() {
        let mut m = model();
        let x = PvX::new(PvId::from("a"), t0());
        let features = m.get_features(&x).unwrap();
        let sample = Sample {
            x,
            y: PvY::new(vec![4.0, 4.0, 4.0]),
            features,
        };
        let mut train = std::iter::once(Ok::<_, PspError>(vec![sample.clone()]));
        let mut valid = std::iter::once(Ok::<_, PspError>(vec![sample.clone()]));
        let report = m.train(&mut train, &mut valid).unwrap();

        assert_eq!(report.train_samples, 1);
        assert_eq!(m.scales, vec![2.0, 2.0, 2.0]);
        assert_eq!(report.valid_mae, Some(0.0));
        assert!(m.metadata.trained_at.is_some());

        let pred = m.predict_from_features(&sample.x, &sample.features).unwrap();
        assert_eq!(pred.powers, vec![4.0, 4.0, 4.0]);
    }

    #[test]
    fn test_train_without_samples_fails() {
        let mut m = model();
        let mut empty = std::iter::empty::<Result<Vec<Sample>>>();
        let mut valid = std::iter::empty::<Result<Vec<Sample>>>();
        assert!(m.train(&mut empty, &mut valid).is_err());
    }

    #[test]
    fn test_predictions_are_non_negative() {
        let mut m = model();
        m.scales = vec![-1.0, 1.0, 1.0];
        let f = FeatureVector::new(
            vec![1.0, 1.0, 1.0, 0.0, 1.0],
            RecentHistoryFeatures::feature_names(&m.config.horizons),
        )
        .unwrap();
        let pred = m.predict_from_features(&PvX::new(PvId::from("a"), t0()), &f).unwrap();
        assert_eq!(pred.powers, vec![0.0, 1.0, 1.0]);
    }
}
