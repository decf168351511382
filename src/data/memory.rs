//! In-memory data source, loadable from CSV.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info};

use super::{PvDataSource, PvRow, PvSeries, SiteAttributes, POWER};
use crate::domain::{PvId, Timestamp};
use crate::error::{PspError, Result};

type SiteSeries = BTreeMap<Timestamp, BTreeMap<String, f64>>;

/// Data source holding every observation in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPvDataSource {
    series: BTreeMap<PvId, SiteSeries>,
    variables: BTreeSet<String>,
    attributes: BTreeMap<PvId, SiteAttributes>,
}

impl InMemoryPvDataSource {
    pub fn new() -> Self {
        let mut variables = BTreeSet::new();
        variables.insert(POWER.to_string());
        Self {
            variables,
            ..Default::default()
        }
    }

    /// Load a long-format CSV with columns `pv_id,ts,<variable>...`.
    ///
    /// Timestamps are RFC 3339. Empty cells are treated as missing.
    pub fn from_csv(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();

        let pv_col = column(&headers, "pv_id")?;
        let ts_col = column(&headers, "ts")?;
        let value_cols: Vec<(usize, String)> = headers
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != pv_col && *i != ts_col)
            .map(|(i, name)| (i, name.to_string()))
            .collect();

        if !value_cols.iter().any(|(_, name)| name == POWER) {
            return Err(PspError::InvalidInput(format!(
                "{} has no '{POWER}' column",
                path.display()
            )));
        }

        let mut source = Self::new();
        let mut rows = 0usize;
        for record in reader.records() {
            let record = record?;
            let pv_id = PvId::from(record.get(pv_col).unwrap_or_default().trim());
            let raw_ts = record.get(ts_col).unwrap_or_default().trim();
            let ts = DateTime::parse_from_rfc3339(raw_ts)
                .map_err(|e| PspError::InvalidInput(format!("bad timestamp '{raw_ts}': {e}")))?
                .with_timezone(&Utc);

            for (i, name) in &value_cols {
                let cell = record.get(*i).unwrap_or_default().trim();
                if cell.is_empty() {
                    continue;
                }
                let value: f64 = cell.parse().map_err(|e| {
                    PspError::InvalidInput(format!("bad value '{cell}' for {name}: {e}"))
                })?;
                source.insert(pv_id.clone(), ts, name, value);
            }
            rows += 1;
        }

        info!(
            path = %path.display(),
            rows,
            sites = source.series.len(),
            "loaded PV data"
        );
        Ok(source)
    }

    pub fn insert(&mut self, pv_id: PvId, ts: Timestamp, variable: &str, value: f64) {
        self.variables.insert(variable.to_string());
        self.series
            .entry(pv_id)
            .or_default()
            .entry(ts)
            .or_default()
            .insert(variable.to_string(), value);
    }

    pub fn insert_power(&mut self, pv_id: PvId, ts: Timestamp, power: f64) {
        self.insert(pv_id, ts, POWER, power);
    }

    pub fn set_attributes(&mut self, pv_id: PvId, attributes: SiteAttributes) {
        self.attributes.insert(pv_id, attributes);
    }
}

fn column(headers: &csv::StringRecord, name: &str) -> Result<usize> {
    headers
        .iter()
        .position(|h| h == name)
        .ok_or_else(|| PspError::InvalidInput(format!("missing '{name}' column")))
}

impl PvDataSource for InMemoryPvDataSource {
    fn list_pv_ids(&self) -> Vec<PvId> {
        self.series.keys().cloned().collect()
    }

    fn list_data_variables(&self) -> BTreeSet<String> {
        self.variables.clone()
    }

    fn get(&self, pv_ids: &[PvId], start_ts: Timestamp, end_ts: Timestamp) -> Result<PvSeries> {
        if start_ts > end_ts {
            return Ok(PvSeries::default());
        }
        let mut rows = Vec::new();
        for pv_id in pv_ids {
            let Some(site) = self.series.get(pv_id) else {
                debug!(%pv_id, "unknown site requested");
                continue;
            };
            rows.extend(site.range(start_ts..=end_ts).map(|(ts, values)| PvRow {
                pv_id: pv_id.clone(),
                ts: *ts,
                values: values.clone(),
            }));
        }
        Ok(PvSeries::new(rows))
    }

    fn site_attributes(&self, pv_id: &PvId) -> Option<SiteAttributes> {
        self.attributes.get(pv_id).cloned()
    }
}
