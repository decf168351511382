//! Multi-model dispatcher
//!
//! Wraps models trained up to different cutoff dates and presents them as a
//! single model. Each timestamp is routed to the most recent model whose
//! training data ended at least `min_lead` earlier.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::{debug, warn};

use super::{FeatureVector, GetFeatures, PvSiteModel, PvSiteModelConfig};
use crate::data::DataSources;
use crate::domain::{PvX, PvY, Timestamp};
use crate::error::{PspError, Result};

/// What to do with a timestamp that precedes every model's validity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FallbackPolicy {
    #[default]
    Error,
    /// Use the earliest model anyway.
    Earliest,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchPolicy {
    /// Minimum gap between a model's cutoff and the timestamps it serves.
    pub min_lead: Duration,
    /// Validity of the latest eligible model; unbounded when `None`.
    pub max_model_age: Option<Duration>,
    pub fallback: FallbackPolicy,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            min_lead: Duration::days(1),
            max_model_age: None,
            fallback: FallbackPolicy::Error,
        }
    }
}

/// Time range served by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Coverage {
    pub start: Timestamp,
    /// Exclusive end, if models expire.
    pub end: Option<Timestamp>,
}

struct Entry {
    cutoff: Timestamp,
    model: Box<dyn PvSiteModel>,
}

pub struct MultiPvSiteModel {
    entries: Vec<Entry>,
    config: PvSiteModelConfig,
    policy: DispatchPolicy,
}

impl MultiPvSiteModel {
    pub fn new(models: Vec<(Timestamp, Box<dyn PvSiteModel>)>, policy: DispatchPolicy) -> Result<Self> {
        if policy.min_lead < Duration::zero() {
            return Err(PspError::Config("min_lead must not be negative".into()));
        }
        if matches!(policy.max_model_age, Some(age) if age <= Duration::zero()) {
            return Err(PspError::Config("max_model_age must be positive".into()));
        }

        let mut entries: Vec<Entry> = models
            .into_iter()
            .map(|(cutoff, model)| Entry { cutoff, model })
            .collect();
        entries.sort_by_key(|e| e.cutoff);

        let first = entries
            .first()
            .ok_or_else(|| PspError::Config("at least one model is required".into()))?;
        let config = first.model.config().clone();

        for pair in entries.windows(2) {
            if pair[0].cutoff == pair[1].cutoff {
                return Err(PspError::Config(format!(
                    "duplicate model cutoff {}",
                    pair[0].cutoff
                )));
            }
        }
        if let Some(e) = entries.iter().find(|e| e.model.config().horizons != config.horizons) {
            return Err(PspError::Config(format!(
                "model with cutoff {} has different horizons",
                e.cutoff
            )));
        }

        Ok(Self {
            entries,
            config,
            policy,
        })
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cutoffs in ascending order.
    pub fn cutoffs(&self) -> Vec<Timestamp> {
        self.entries.iter().map(|e| e.cutoff).collect()
    }

    pub fn coverage(&self) -> Coverage {
        // Entries are never empty after construction.
        let start = self.entries[0].cutoff + self.policy.min_lead;
        let end = self.policy.max_model_age.and_then(|age| {
            self.entries
                .last()
                .map(|e| e.cutoff + self.policy.min_lead + age)
        });
        Coverage { start, end }
    }

    /// Fail unless every timestamp in `[start, end]` resolves to a model.
    pub fn check_window(&self, start: Timestamp, end: Timestamp) -> Result<()> {
        self.resolve_index(start)?;
        if let Some(age) = self.policy.max_model_age {
            // Gaps can only open where an eligible model expires.
            for e in &self.entries {
                let expires = e.cutoff + self.policy.min_lead + age;
                if expires > start && expires <= end {
                    self.resolve_index(expires)?;
                }
            }
        }
        Ok(())
    }

    /// Index of the model serving timestamp `ts`.
    pub fn resolve_index(&self, ts: Timestamp) -> Result<usize> {
        let eligible = self
            .entries
            .partition_point(|e| e.cutoff + self.policy.min_lead <= ts);

        if eligible == 0 {
            return match self.policy.fallback {
                FallbackPolicy::Error => Err(PspError::DispatchCoverage {
                    ts,
                    reason: format!(
                        "no model has a cutoff at least {}h before",
                        self.policy.min_lead.num_hours()
                    ),
                }),
                FallbackPolicy::Earliest => {
                    warn!(%ts, cutoff = %self.entries[0].cutoff, "no causally valid model, falling back to earliest");
                    Ok(0)
                }
            };
        }

        let index = eligible - 1;
        if let Some(age) = self.policy.max_model_age {
            let expires = self.entries[index].cutoff + self.policy.min_lead + age;
            if ts >= expires {
                return Err(PspError::DispatchCoverage {
                    ts,
                    reason: format!("latest eligible model expired at {expires}"),
                });
            }
        }
        debug!(%ts, cutoff = %self.entries[index].cutoff, "dispatched");
        Ok(index)
    }

    /// Model serving timestamp `ts`, with its cutoff.
    pub fn resolve(&self, ts: Timestamp) -> Result<(Timestamp, &dyn PvSiteModel)> {
        let entry = &self.entries[self.resolve_index(ts)?];
        Ok((entry.cutoff, entry.model.as_ref()))
    }
}

impl GetFeatures for MultiPvSiteModel {
    fn get_features(&self, x: &PvX) -> Result<FeatureVector> {
        self.resolve(x.ts)?.1.get_features(x)
    }
}

impl PvSiteModel for MultiPvSiteModel {
    fn config(&self) -> &PvSiteModelConfig {
        &self.config
    }

    fn predict_from_features(&self, x: &PvX, features: &FeatureVector) -> Result<PvY> {
        self.resolve(x.ts)?.1.predict_from_features(x, features)
    }

    fn set_data_sources(&mut self, sources: &DataSources) {
        for entry in &mut self.entries {
            entry.model.set_data_sources(sources);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Horizons, PvId};
    use chrono::{TimeZone, Utc};
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Predicts a constant equal to its tag.
    struct Tagged {
        tag: f64,
        config: PvSiteModelConfig,
        sources_set: Arc<AtomicUsize>,
    }

    impl GetFeatures for Tagged {
        fn get_features(&self, _x: &PvX) -> Result<FeatureVector> {
            FeatureVector::new(vec![self.tag], vec!["tag".into()])
        }
    }

    impl PvSiteModel for Tagged {
        fn config(&self) -> &PvSiteModelConfig {
            &self.config
        }

        fn predict_from_features(&self, _x: &PvX, features: &FeatureVector) -> Result<PvY> {
            Ok(PvY::new(vec![features.features[0]]))
        }

        fn set_data_sources(&mut self, _sources: &DataSources) {
            self.sources_set.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn date(y: i32, m: u32, d: u32) -> Timestamp {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn tagged(tag: f64, horizon_count: usize, counter: &Arc<AtomicUsize>) -> Box<dyn PvSiteModel> {
        Box::new(Tagged {
            tag,
            config: PvSiteModelConfig {
                horizons: Horizons::uniform(60, horizon_count).unwrap(),
            },
            sources_set: Arc::clone(counter),
        })
    }

    fn dispatcher(policy: DispatchPolicy) -> MultiPvSiteModel {
        let counter = Arc::new(AtomicUsize::new(0));
        // Deliberately out of order.
        MultiPvSiteModel::new(
            vec![
                (date(2021, 2, 1), tagged(2.0, 1, &counter)),
                (date(2021, 1, 1), tagged(1.0, 1, &counter)),
            ],
            policy,
        )
        .unwrap()
    }

    fn predict(m: &MultiPvSiteModel, ts: Timestamp) -> Result<f64> {
        m.predict(&PvX::new(PvId::from("a"), ts)).map(|y| y.powers[0])
    }

    #[test]
    fn test_dispatch_is_causal() {
        let m = dispatcher(DispatchPolicy::default());
        assert_eq!(m.cutoffs(), vec![date(2021, 1, 1), date(2021, 2, 1)]);
        assert_eq!(predict(&m, date(2021, 1, 15)).unwrap(), 1.0);
        assert!(matches!(
            predict(&m, date(2020, 12, 1)),
            Err(PspError::DispatchCoverage { .. })
        ));
    }

    #[rstest]
    #[case(date(2021, 1, 2), 1.0)]
    #[case(date(2021, 2, 1), 1.0)]
    #[case(date(2021, 2, 2), 2.0)]
    #[case(date(2022, 6, 1), 2.0)]
    fn test_min_lead_boundaries(#[case] ts: Timestamp, #[case] expected: f64) {
        let m = dispatcher(DispatchPolicy::default());
        assert_eq!(predict(&m, ts).unwrap(), expected);
    }

    #[test]
    fn test_min_lead_is_configurable() {
        let m = dispatcher(DispatchPolicy {
            min_lead: Duration::zero(),
            ..Default::default()
        });
        assert_eq!(predict(&m, date(2021, 2, 1)).unwrap(), 2.0);
        assert_eq!(predict(&m, date(2021, 1, 1)).unwrap(), 1.0);
    }

    #[test]
    fn test_earliest_fallback_is_opt_in() {
        let m = dispatcher(DispatchPolicy {
            fallback: FallbackPolicy::Earliest,
            ..Default::default()
        });
        assert_eq!(predict(&m, date(2020, 12, 1)).unwrap(), 1.0);
    }

    #[test]
    fn test_max_model_age() {
        let m = dispatcher(DispatchPolicy {
            max_model_age: Some(Duration::days(30)),
            ..Default::default()
        });
        assert_eq!(predict(&m, date(2021, 3, 1)).unwrap(), 2.0);
        assert!(matches!(
            predict(&m, date(2021, 3, 4)),
            Err(PspError::DispatchCoverage { .. })
        ));
        let coverage = m.coverage();
        assert_eq!(coverage.start, date(2021, 1, 2));
        assert_eq!(coverage.end, Some(date(2021, 3, 4)));
    }

    #[test]
    fn test_check_window() {
        let m = dispatcher(DispatchPolicy::default());
        assert!(m.check_window(date(2021, 1, 2), date(2022, 1, 1)).is_ok());
        assert!(matches!(
            m.check_window(date(2021, 1, 1), date(2021, 1, 10)),
            Err(PspError::DispatchCoverage { .. })
        ));

        // The first model expires on 2021-01-22, before the second becomes eligible.
        let m = dispatcher(DispatchPolicy {
            max_model_age: Some(Duration::days(20)),
            ..Default::default()
        });
        assert!(m.check_window(date(2021, 1, 2), date(2021, 1, 20)).is_ok());
        assert!(matches!(
            m.check_window(date(2021, 1, 10), date(2021, 2, 10)),
            Err(PspError::DispatchCoverage { .. })
        ));
        assert!(m.check_window(date(2021, 2, 2), date(2021, 2, 10)).is_ok());
    }

    #[test]
    fn test_construction_checks() {
        let counter = Arc::new(AtomicUsize::new(0));
        assert!(MultiPvSiteModel::new(vec![], DispatchPolicy::default()).is_err());

        let duplicate = vec![
            (date(2021, 1, 1), tagged(1.0, 1, &counter)),
            (date(2021, 1, 1), tagged(2.0, 1, &counter)),
        ];
        assert!(matches!(
            MultiPvSiteModel::new(duplicate, DispatchPolicy::default()),
            Err(PspError::Config(_))
        ));

        let mixed = vec![
            (date(2021, 1, 1), tagged(1.0, 1, &counter)),
            (date(2021, 2, 1), tagged(2.0, 2, &counter)),
        ];
        assert!(matches!(
            MultiPvSiteModel::new(mixed, DispatchPolicy::default()),
            Err(PspError::Config(_))
        ));
    }

    #[test]
    fn test_set_data_sources_fans_out() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut m = MultiPvSiteModel::new(
            vec![
                (date(2021, 1, 1), tagged(1.0, 1, &counter)),
                (date(2021, 2, 1), tagged(2.0, 1, &counter)),
            ],
            DispatchPolicy::default(),
        )
        .unwrap();
        let source = Arc::new(crate::data::InMemoryPvDataSource::new());
        m.set_data_sources(&DataSources::new(source));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
