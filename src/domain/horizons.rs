//! Forecast horizons
//!
//! A horizon is a half-open offset interval `[start, end)` relative to the
//! reference time of a forecast. Horizons are ordered and the position in the
//! list is the index into every `PvY` vector.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{PspError, Result};

/// Single horizon, stored in minutes so that model artifacts stay plain data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Horizon {
    pub start_minutes: i64,
    pub end_minutes: i64,
}

impl Horizon {
    pub fn new(start_minutes: i64, end_minutes: i64) -> Self {
        Self {
            start_minutes,
            end_minutes,
        }
    }

    pub fn start(&self) -> Duration {
        Duration::minutes(self.start_minutes)
    }

    pub fn end(&self) -> Duration {
        Duration::minutes(self.end_minutes)
    }
}

/// Ordered horizon configuration of a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Horizon>", into = "Vec<Horizon>")]
pub struct Horizons(Vec<Horizon>);

impl Horizons {
    pub fn new(horizons: Vec<Horizon>) -> Result<Self> {
        if horizons.is_empty() {
            return Err(PspError::Config("at least one horizon is required".into()));
        }
        for (i, h) in horizons.iter().enumerate() {
            if h.start_minutes < 0 || h.start_minutes >= h.end_minutes {
                return Err(PspError::Config(format!(
                    "horizon {i} is not a valid [start, end) range: [{}, {})",
                    h.start_minutes, h.end_minutes
                )));
            }
        }
        if horizons
            .windows(2)
            .any(|w| w[0].start_minutes > w[1].start_minutes)
        {
            return Err(PspError::Config("horizons must be ordered by start".into()));
        }
        Ok(Self(horizons))
    }

    /// `count` contiguous horizons of `duration_minutes` each, starting at the reference time.
    pub fn uniform(duration_minutes: i64, count: usize) -> Result<Self> {
        let horizons = (0..count as i64)
            .map(|i| Horizon::new(i * duration_minutes, (i + 1) * duration_minutes))
            .collect();
        Self::new(horizons)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Horizon> {
        self.0.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Horizon> {
        self.0.iter()
    }

    /// Furthest offset any horizon reaches.
    pub fn span(&self) -> Duration {
        Duration::minutes(self.0.iter().map(|h| h.end_minutes).max().unwrap_or(0))
    }
}

impl TryFrom<Vec<Horizon>> for Horizons {
    type Error = PspError;

    fn try_from(value: Vec<Horizon>) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Horizons> for Vec<Horizon> {
    fn from(h: Horizons) -> Self {
        h.0
    }
}

impl<'a> IntoIterator for &'a Horizons {
    type Item = &'a Horizon;
    type IntoIter = std::slice::Iter<'a, Horizon>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
