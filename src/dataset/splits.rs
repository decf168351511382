//! Train / valid / test partitioning of sites, and date splits for per-date models.

use chrono::{Duration, NaiveDate, NaiveTime};
use itertools::Itertools;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use strum::{Display, EnumString};
use tracing::{info, warn};
use validator::Validate;

use crate::data::PvDataSource;
use crate::domain::{PvId, Timestamp};
use crate::error::{PspError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SplitName {
    Train,
    Valid,
    Test,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SplitConfig {
    pub seed: u64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub valid_fraction: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub test_fraction: f64,
    /// Sites explicitly left out of every split (e.g. known bad data).
    #[serde(default)]
    pub exclude: Vec<PvId>,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            seed: 1234,
            valid_fraction: 0.1,
            test_fraction: 0.2,
            exclude: Vec::new(),
        }
    }
}

/// Disjoint site sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PvSplits {
    pub train: Vec<PvId>,
    pub valid: Vec<PvId>,
    pub test: Vec<PvId>,
}

impl PvSplits {
    pub fn get(&self, name: SplitName) -> &[PvId] {
        match name {
            SplitName::Train => &self.train,
            SplitName::Valid => &self.valid,
            SplitName::Test => &self.test,
        }
    }

    /// Check that the sets are pairwise disjoint and cover exactly `expected`.
    pub fn validate(&self, expected: &BTreeSet<PvId>) -> Result<()> {
        let mut seen = BTreeSet::new();
        for (name, ids) in [
            (SplitName::Train, &self.train),
            (SplitName::Valid, &self.valid),
            (SplitName::Test, &self.test),
        ] {
            for id in ids {
                if !seen.insert(id) {
                    return Err(PspError::SplitIntegrity(format!(
                        "{id} appears more than once (last seen in {name})"
                    )));
                }
                if !expected.contains(id) {
                    return Err(PspError::SplitIntegrity(format!(
                        "{id} in {name} is not a known site"
                    )));
                }
            }
        }
        if let Some(missing) = expected.iter().find(|id| !seen.contains(id)) {
            return Err(PspError::SplitIntegrity(format!(
                "{missing} is not assigned to any split"
            )));
        }
        Ok(())
    }
}

/// Deterministically partition the sites of `source`.
pub fn split_train_test(source: &dyn PvDataSource, config: &SplitConfig) -> Result<PvSplits> {
    if config.valid_fraction + config.test_fraction >= 1.0 {
        return Err(PspError::Config(format!(
            "valid_fraction + test_fraction must be < 1, got {}",
            config.valid_fraction + config.test_fraction
        )));
    }

    let excluded: BTreeSet<&PvId> = config.exclude.iter().collect();
    let all: BTreeSet<PvId> = source.list_pv_ids().into_iter().collect();
    let kept: BTreeSet<PvId> = all
        .iter()
        .filter(|id| !excluded.contains(id))
        .cloned()
        .collect();
    if kept.len() != all.len() {
        info!(excluded = all.len() - kept.len(), "sites excluded from splits");
    }

    let mut ids: Vec<PvId> = kept.iter().cloned().collect();
    let mut rng = StdRng::seed_from_u64(config.seed);
    ids.shuffle(&mut rng);

    let n = ids.len();
    let n_test = (n as f64 * config.test_fraction).round() as usize;
    let n_valid = (n as f64 * config.valid_fraction).round() as usize;
    if n_test + n_valid >= n {
        return Err(PspError::SplitIntegrity(format!(
            "no sites left for training ({n} sites, {n_valid} valid, {n_test} test)"
        )));
    }

    let test = ids[..n_test].iter().cloned().sorted().collect();
    let valid = ids[n_test..n_test + n_valid].iter().cloned().sorted().collect();
    let train = ids[n_test + n_valid..].iter().cloned().sorted().collect();

    let splits = PvSplits { train, valid, test };
    splits.validate(&kept)?;

    if splits.valid.is_empty() || splits.test.is_empty() {
        warn!(
            valid = splits.valid.len(),
            test = splits.test.len(),
            "a held-out split is empty"
        );
    }
    Ok(splits)
}

/// Short human readable summary of a site list for logs.
pub fn pv_list_to_short_str(ids: &[PvId]) -> String {
    const SHOWN: usize = 3;
    if ids.len() <= 2 * SHOWN {
        return format!("{} ({})", ids.iter().join(", "), ids.len());
    }
    format!(
        "{}, ..., {} ({})",
        ids[..SHOWN].iter().join(", "),
        ids[ids.len() - SHOWN..].iter().join(", "),
        ids.len()
    )
}

/// Training cutoff dates, one model per date.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DateSplits {
    #[validate(length(min = 1))]
    pub train_dates: Vec<NaiveDate>,
    #[validate(range(min = 1))]
    pub num_train_days: i64,
    #[validate(range(min = 1))]
    pub num_test_days: i64,
}

impl Default for DateSplits {
    fn default() -> Self {
        Self {
            train_dates: Vec::new(),
            num_train_days: 90,
            num_test_days: 30,
        }
    }
}

impl DateSplits {
    pub fn cutoff(&self, index: usize) -> Result<Timestamp> {
        self.train_dates
            .get(index)
            .map(|d| d.and_time(NaiveTime::MIN).and_utc())
            .ok_or_else(|| {
                PspError::InvalidInput(format!(
                    "cutoff index {index} out of range ({} train dates)",
                    self.train_dates.len()
                ))
            })
    }

    pub fn cutoffs(&self) -> Vec<Timestamp> {
        self.train_dates
            .iter()
            .map(|d| d.and_time(NaiveTime::MIN).and_utc())
            .collect()
    }

    /// Data window `[cutoff - num_train_days, cutoff]` of the model at `index`.
    pub fn train_window(&self, index: usize) -> Result<(Timestamp, Timestamp)> {
        let cutoff = self.cutoff(index)?;
        Ok((cutoff - Duration::days(self.num_train_days), cutoff))
    }

    /// Evaluation window, starting once the earliest model becomes usable.
    pub fn test_window(&self, min_lead: Duration) -> Result<(Timestamp, Timestamp)> {
        let first = self
            .cutoffs()
            .into_iter()
            .min()
            .ok_or_else(|| PspError::Config("no train dates configured".into()))?;
        let start = first + min_lead;
        Ok((start, start + Duration::days(self.num_test_days)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::InMemoryPvDataSource;
    use chrono::{TimeZone, Utc};

    fn source(n: usize) -> InMemoryPvDataSource {
        let ts = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        let mut s = InMemoryPvDataSource::new();
        for i in 0..n {
            s.insert_power(PvId::from(format!("pv_{i:03}")), ts, 0.0);
        }
        s
    }

    #[test]
    fn test_split_is_deterministic() {
        let s = source(50);
        let a = split_train_test(&s, &SplitConfig::default()).unwrap();
        let b = split_train_test(&s, &SplitConfig::default()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_seed_different_split() {
        let s = source(50);
        let a = split_train_test(&s, &SplitConfig::default()).unwrap();
        let b = split_train_test(
            &s,
            &SplitConfig {
                seed: 99,
                ..Default::default()
            },
        )
        .unwrap();
        assert_ne!(a.test, b.test);
    }

    #[test]
    fn test_split_sizes() {
        let s = source(100);
        let splits = split_train_test(&s, &SplitConfig::default()).unwrap();
        assert_eq!(splits.test.len(), 20);
        assert_eq!(splits.valid.len(), 10);
        assert_eq!(splits.train.len(), 70);
    }

    #[test]
    fn test_excluded_sites_are_left_out() {
        let s = source(10);
        let config = SplitConfig {
            exclude: vec![PvId::from("pv_003")],
            ..Default::default()
        };
        let splits = split_train_test(&s, &config).unwrap();
        let total = splits.train.len() + splits.valid.len() + splits.test.len();
        assert_eq!(total, 9);
        assert!(!splits.train.contains(&PvId::from("pv_003")));
    }

    #[test]
    fn test_validate_detects_overlap() {
        let expected: BTreeSet<PvId> = ["a", "b"].into_iter().map(PvId::from).collect();
        let splits = PvSplits {
            train: vec![PvId::from("a"), PvId::from("b")],
            valid: vec![PvId::from("a")],
            test: vec![],
        };
        assert!(matches!(
            splits.validate(&expected),
            Err(PspError::SplitIntegrity(_))
        ));
    }

    #[test]
    fn test_validate_detects_unassigned() {
        let expected: BTreeSet<PvId> = ["a", "b"].into_iter().map(PvId::from).collect();
        let splits = PvSplits {
            train: vec![PvId::from("a")],
            valid: vec![],
            test: vec![],
        };
        assert!(splits.validate(&expected).is_err());
    }

    #[test]
    fn test_fractions_must_leave_training_sites() {
        let s = source(10);
        let config = SplitConfig {
            valid_fraction: 0.5,
            test_fraction: 0.5,
            ..Default::default()
        };
        assert!(split_train_test(&s, &config).is_err());
    }

    #[test]
    fn test_short_str() {
        let ids: Vec<PvId> = (0..10).map(|i| PvId::from(i.to_string())).collect();
        assert_eq!(pv_list_to_short_str(&ids), "0, 1, 2, ..., 7, 8, 9 (10)");
        assert_eq!(pv_list_to_short_str(&ids[..2]), "0, 1 (2)");
    }

    #[test]
    fn test_date_windows() {
        let dates = DateSplits {
            train_dates: vec![
                NaiveDate::from_ymd_opt(2021, 2, 1).unwrap(),
                NaiveDate::from_ymd_opt(2021, 1, 1).unwrap(),
            ],
            num_train_days: 30,
            num_test_days: 10,
        };
        let (start, end) = dates.train_window(0).unwrap();
        assert_eq!(end, Utc.with_ymd_and_hms(2021, 2, 1, 0, 0, 0).unwrap());
        assert_eq!(start, Utc.with_ymd_and_hms(2021, 1, 2, 0, 0, 0).unwrap());

        let (test_start, test_end) = dates.test_window(Duration::days(1)).unwrap();
        assert_eq!(test_start, Utc.with_ymd_and_hms(2021, 1, 2, 0, 0, 0).unwrap());
        assert_eq!(test_end, Utc.with_ymd_and_hms(2021, 1, 12, 0, 0, 0).unwrap());

        assert!(dates.cutoff(2).is_err());
    }
}
