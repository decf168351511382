//! Candidate enumeration and sampling decisions.
//!
//! Every decision is a pure function of the policy seed and the candidate
//! index, so any thread can recompute it and a run is reproducible.

use chrono::Duration;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

use crate::domain::{PvId, PvX, Timestamp};
use crate::error::{PspError, Result};

/// How candidates are drawn from a (sites × time range) grid.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingPolicy {
    /// Spacing between candidate reference timestamps.
    pub step: Duration,
    pub prob_keep_sample: f64,
    /// Stop after this many samples have been yielded.
    pub limit: Option<usize>,
    pub shuffle: bool,
    pub seed: u64,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            step: Duration::minutes(15),
            prob_keep_sample: 1.0,
            limit: None,
            shuffle: false,
            seed: 1234,
        }
    }
}

impl SamplingPolicy {
    pub fn validate(&self) -> Result<()> {
        step_seconds(self.step)?;
        if !(0.0..=1.0).contains(&self.prob_keep_sample) {
            return Err(PspError::InvalidInput(format!(
                "prob_keep_sample must be in [0, 1], got {}",
                self.prob_keep_sample
            )));
        }
        Ok(())
    }

    /// Bernoulli keep decision for candidate `index`.
    pub fn keeps(&self, index: usize) -> bool {
        if self.prob_keep_sample >= 1.0 {
            return true;
        }
        if self.prob_keep_sample <= 0.0 {
            return false;
        }
        let mut rng = StdRng::seed_from_u64(substream_seed(self.seed, index as u64));
        rng.gen_bool(self.prob_keep_sample)
    }
}

/// Step length in seconds. Only positive whole-second steps keep every grid
/// point inside the closed range.
fn step_seconds(step: Duration) -> Result<i64> {
    let secs = step.num_seconds();
    if secs <= 0 || Duration::seconds(secs) != step {
        return Err(PspError::InvalidInput(format!(
            "step must be a positive whole number of seconds, got {step}"
        )));
    }
    Ok(secs)
}

/// Seed of the independent random stream for candidate `index`.
///
/// splitmix64 finalizer over the base seed and the index.
pub fn substream_seed(seed: u64, index: u64) -> u64 {
    let mut z = seed ^ index.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Implicit grid of candidates: `index = site * steps_per_site + k`.
#[derive(Debug, Clone)]
pub struct CandidateGrid {
    pv_ids: Arc<[PvId]>,
    start_ts: Timestamp,
    step: Duration,
    steps_per_site: usize,
}

impl CandidateGrid {
    pub fn new(pv_ids: &[PvId], start_ts: Timestamp, end_ts: Timestamp, step: Duration) -> Result<Self> {
        if pv_ids.is_empty() {
            return Err(PspError::InvalidInput("no site ids to sample from".into()));
        }
        if start_ts > end_ts {
            return Err(PspError::InvalidInput(format!(
                "start {start_ts} is after end {end_ts}"
            )));
        }
        let step_secs = step_seconds(step)?;
        let span = (end_ts - start_ts).num_seconds();
        let steps_per_site = (span / step_secs) as usize + 1;
        Ok(Self {
            pv_ids: pv_ids.into(),
            start_ts,
            step,
            steps_per_site,
        })
    }

    pub fn len(&self) -> usize {
        self.pv_ids.len() * self.steps_per_site
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<PvX> {
        if index >= self.len() {
            return None;
        }
        let site = index / self.steps_per_site;
        let k = (index % self.steps_per_site) as i32;
        Some(PvX::new(
            self.pv_ids[site].clone(),
            self.start_ts + self.step * k,
        ))
    }
}

enum Order {
    Sequential(std::ops::Range<usize>),
    Shuffled(std::vec::IntoIter<usize>),
}

/// Iterator over kept candidates in delivery order.
pub struct Candidates {
    grid: CandidateGrid,
    policy: SamplingPolicy,
    order: Order,
}

impl Candidates {
    pub fn new(grid: CandidateGrid, policy: SamplingPolicy) -> Result<Self> {
        policy.validate()?;
        let order = if policy.shuffle {
            let mut indices: Vec<usize> = (0..grid.len()).collect();
            indices.shuffle(&mut StdRng::seed_from_u64(policy.seed));
            Order::Shuffled(indices.into_iter())
        } else {
            Order::Sequential(0..grid.len())
        };
        Ok(Self {
            grid,
            policy,
            order,
        })
    }

    pub fn total(&self) -> usize {
        self.grid.len()
    }
}

impl Iterator for Candidates {
    type Item = (usize, PvX);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let index = match &mut self.order {
                Order::Sequential(range) => range.next()?,
                Order::Shuffled(it) => it.next()?,
            };
            if self.policy.keeps(index) {
                return self.grid.get(index).map(|x| (index, x));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    fn ids(n: usize) -> Vec<PvId> {
        (0..n).map(|i| PvId::from(format!("pv_{i}"))).collect()
    }

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_grid_is_inclusive_of_end() {
        let grid = CandidateGrid::new(&ids(2), t0(), t0() + Duration::hours(1), Duration::minutes(15)).unwrap();
        assert_eq!(grid.len(), 10);
        assert_eq!(grid.get(4).unwrap().ts, t0() + Duration::hours(1));
        assert_eq!(grid.get(5).unwrap().pv_id, PvId::from("pv_1"));
        assert_eq!(grid.get(5).unwrap().ts, t0());
        assert!(grid.get(10).is_none());
    }

    #[test]
    fn test_grid_rejects_bad_input() {
        assert!(CandidateGrid::new(&[], t0(), t0(), Duration::minutes(15)).is_err());
        assert!(CandidateGrid::new(&ids(1), t0() + Duration::hours(1), t0(), Duration::minutes(15)).is_err());
        assert!(CandidateGrid::new(&ids(1), t0(), t0(), Duration::zero()).is_err());
    }

    #[test]
    fn test_sub_second_step_rejected() {
        let step = Duration::milliseconds(500);
        assert!(CandidateGrid::new(&ids(1), t0(), t0() + Duration::hours(1), step).is_err());
        let policy = SamplingPolicy {
            step,
            ..Default::default()
        };
        assert!(matches!(policy.validate(), Err(PspError::InvalidInput(_))));
    }

    #[test]
    fn test_fractional_second_step_rejected() {
        let step = Duration::milliseconds(90_500);
        assert!(CandidateGrid::new(&ids(1), t0(), t0() + Duration::seconds(180), step).is_err());
        let policy = SamplingPolicy {
            step,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_grid_never_passes_end() {
        let end = t0() + Duration::seconds(180);
        let grid = CandidateGrid::new(&ids(1), t0(), end, Duration::seconds(90)).unwrap();
        assert_eq!(grid.len(), 3);
        assert_eq!(grid.get(2).unwrap().ts, end);

        let grid = CandidateGrid::new(&ids(1), t0(), end, Duration::seconds(91)).unwrap();
        assert_eq!(grid.len(), 2);
        assert!(grid.get(1).unwrap().ts <= end);
    }

    #[test]
    fn test_sequential_order() {
        let grid = CandidateGrid::new(&ids(2), t0(), t0() + Duration::minutes(30), Duration::minutes(15)).unwrap();
        let indices: Vec<usize> = Candidates::new(grid, SamplingPolicy::default())
            .unwrap()
            .map(|(i, _)| i)
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_shuffle_is_a_permutation() {
        let grid = CandidateGrid::new(&ids(3), t0(), t0() + Duration::hours(2), Duration::minutes(15)).unwrap();
        let policy = SamplingPolicy {
            shuffle: true,
            ..Default::default()
        };
        let mut indices: Vec<usize> = Candidates::new(grid.clone(), policy)
            .unwrap()
            .map(|(i, _)| i)
            .collect();
        assert_ne!(indices, (0..grid.len()).collect::<Vec<_>>());
        indices.sort_unstable();
        assert_eq!(indices, (0..grid.len()).collect::<Vec<_>>());
    }

    #[test]
    fn test_prob_keep_zero_keeps_nothing() {
        let grid = CandidateGrid::new(&ids(2), t0(), t0() + Duration::hours(1), Duration::minutes(15)).unwrap();
        let policy = SamplingPolicy {
            prob_keep_sample: 0.0,
            ..Default::default()
        };
        assert_eq!(Candidates::new(grid, policy).unwrap().count(), 0);
    }

    #[test]
    fn test_invalid_probability_rejected() {
        let grid = CandidateGrid::new(&ids(1), t0(), t0(), Duration::minutes(15)).unwrap();
        let policy = SamplingPolicy {
            prob_keep_sample: 1.5,
            ..Default::default()
        };
        assert!(Candidates::new(grid, policy).is_err());
    }

    #[test]
    fn test_keep_rate_is_close_to_probability() {
        let policy = SamplingPolicy {
            prob_keep_sample: 0.3,
            ..Default::default()
        };
        let kept = (0..10_000).filter(|i| policy.keeps(*i)).count();
        assert!((2_700..3_300).contains(&kept), "kept {kept}");
    }

    proptest! {
        #[test]
        fn keep_decision_is_pure(seed in any::<u64>(), index in 0usize..1_000_000, p in 0.0f64..1.0) {
            let policy = SamplingPolicy { prob_keep_sample: p, seed, ..Default::default() };
            prop_assert_eq!(policy.keeps(index), policy.keeps(index));
        }

        #[test]
        fn substreams_differ_between_neighbours(seed in any::<u64>(), index in 0u64..1_000_000) {
            prop_assert_ne!(substream_seed(seed, index), substream_seed(seed, index + 1));
        }
    }
}
