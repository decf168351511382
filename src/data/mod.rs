//! PV time-series data sources
//!
//! The storage engine behind a data source is out of scope; this module defines the
//! contract the sampling and evaluation core relies on, plus a few composable views.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::domain::{PvId, Timestamp};
use crate::error::Result;

pub mod memory;
pub mod units;
pub mod views;

pub use memory::InMemoryPvDataSource;
pub use units::{resolve_units, PowerUnit, UnitConversion};
pub use views::{without_future, CausalView, ScaledPvDataSource};

/// Name of the power variable every source must provide.
pub const POWER: &str = "power";
/// Name of the optional installed capacity variable.
pub const CAPACITY: &str = "capacity";

/// Static attributes of a site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteAttributes {
    pub latitude: f64,
    pub longitude: f64,
    pub capacity: Option<f64>,
}

/// Historical PV data, keyed by site and timestamp.
pub trait PvDataSource: Send + Sync {
    /// All site ids known to the source, sorted.
    fn list_pv_ids(&self) -> Vec<PvId>;

    /// Variables available in the series (always contains [`POWER`]).
    fn list_data_variables(&self) -> BTreeSet<String>;

    /// Observations for `pv_ids` with `start_ts <= ts <= end_ts`.
    fn get(&self, pv_ids: &[PvId], start_ts: Timestamp, end_ts: Timestamp) -> Result<PvSeries>;

    fn site_attributes(&self, _pv_id: &PvId) -> Option<SiteAttributes> {
        None
    }
}

/// Set of data sources a model may need. Fanned out by the multi-model dispatcher.
#[derive(Clone)]
pub struct DataSources {
    pub pv: Arc<dyn PvDataSource>,
}

impl DataSources {
    pub fn new(pv: Arc<dyn PvDataSource>) -> Self {
        Self { pv }
    }
}

/// One observation row.
#[derive(Debug, Clone, PartialEq)]
pub struct PvRow {
    pub pv_id: PvId,
    pub ts: Timestamp,
    pub values: BTreeMap<String, f64>,
}

/// Tabular result of [`PvDataSource::get`], rows ordered by site then timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PvSeries {
    rows: Vec<PvRow>,
}

impl PvSeries {
    pub fn new(mut rows: Vec<PvRow>) -> Self {
        rows.sort_by(|a, b| (&a.pv_id, a.ts).cmp(&(&b.pv_id, b.ts)));
        Self { rows }
    }

    pub fn rows(&self) -> &[PvRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Non-NaN values of `variable`, in row order.
    pub fn variable<'a>(&'a self, variable: &'a str) -> impl Iterator<Item = (Timestamp, f64)> + 'a {
        self.rows.iter().filter_map(move |row| {
            row.values
                .get(variable)
                .copied()
                .filter(|v| !v.is_nan())
                .map(|v| (row.ts, v))
        })
    }

    pub fn last_value(&self, variable: &str) -> Option<f64> {
        self.variable(variable).last().map(|(_, v)| v)
    }

    /// Mean of `variable` over `[start, end)`.
    pub fn mean_between(&self, variable: &str, start: Timestamp, end: Timestamp) -> Option<f64> {
        let (sum, count) = self
            .variable(variable)
            .filter(|(ts, _)| *ts >= start && *ts < end)
            .fold((0.0, 0usize), |(s, c), (_, v)| (s + v, c + 1));
        (count > 0).then(|| sum / count as f64)
    }

    pub(crate) fn scale(&mut self, variable: &str, factor: f64) {
        for row in &mut self.rows {
            if let Some(v) = row.values.get_mut(variable) {
                *v *= factor;
            }
        }
    }

    pub(crate) fn retain_until(&mut self, max_ts: Timestamp) {
        self.rows.retain(|row| row.ts <= max_ts);
    }
}
