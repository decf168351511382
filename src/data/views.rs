//! Wrappers that restrict or rescale what a data source returns.

use chrono::Duration;
use std::collections::BTreeSet;
use std::sync::Arc;

use super::{PvDataSource, PvSeries, SiteAttributes, UnitConversion, CAPACITY, POWER};
use crate::domain::{PvId, Timestamp};
use crate::error::Result;

/// View of a data source that cannot see anything after `max_ts`.
pub struct CausalView {
    inner: Arc<dyn PvDataSource>,
    max_ts: Timestamp,
}

/// Hide every observation after `ts - lag`.
///
/// Feature extraction goes through this so a model never reads data that
/// would not have been available at forecast time.
pub fn without_future(source: Arc<dyn PvDataSource>, ts: Timestamp, lag: Duration) -> CausalView {
    CausalView {
        inner: source,
        max_ts: ts - lag,
    }
}

impl PvDataSource for CausalView {
    fn list_pv_ids(&self) -> Vec<PvId> {
        self.inner.list_pv_ids()
    }

    fn list_data_variables(&self) -> BTreeSet<String> {
        self.inner.list_data_variables()
    }

    fn get(&self, pv_ids: &[PvId], start_ts: Timestamp, end_ts: Timestamp) -> Result<PvSeries> {
        let end = end_ts.min(self.max_ts);
        if start_ts > end {
            return Ok(PvSeries::default());
        }
        let mut series = self.inner.get(pv_ids, start_ts, end)?;
        series.retain_until(self.max_ts);
        Ok(series)
    }

    fn site_attributes(&self, pv_id: &PvId) -> Option<SiteAttributes> {
        self.inner.site_attributes(pv_id)
    }
}

/// Applies a unit conversion to power and capacity on every read.
pub struct ScaledPvDataSource {
    inner: Arc<dyn PvDataSource>,
    conversion: UnitConversion,
}

impl ScaledPvDataSource {
    pub fn new(inner: Arc<dyn PvDataSource>, conversion: UnitConversion) -> Self {
        Self { inner, conversion }
    }
}

impl PvDataSource for ScaledPvDataSource {
    fn list_pv_ids(&self) -> Vec<PvId> {
        self.inner.list_pv_ids()
    }

    fn list_data_variables(&self) -> BTreeSet<String> {
        self.inner.list_data_variables()
    }

    fn get(&self, pv_ids: &[PvId], start_ts: Timestamp, end_ts: Timestamp) -> Result<PvSeries> {
        let mut series = self.inner.get(pv_ids, start_ts, end_ts)?;
        series.scale(POWER, self.conversion.power_factor);
        series.scale(CAPACITY, self.conversion.capacity_factor);
        Ok(series)
    }

    fn site_attributes(&self, pv_id: &PvId) -> Option<SiteAttributes> {
        self.inner.site_attributes(pv_id).map(|mut attrs| {
            attrs.capacity = attrs.capacity.map(|c| c * self.conversion.capacity_factor);
            attrs
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::InMemoryPvDataSource;
    use chrono::{TimeZone, Utc};

    fn source() -> (Arc<dyn PvDataSource>, Timestamp) {
        let t0 = Utc.with_ymd_and_hms(2021, 6, 1, 12, 0, 0).unwrap();
        let mut s = InMemoryPvDataSource::new();
        for i in 0..8 {
            let ts = t0 + Duration::minutes(15 * i);
            s.insert_power(PvId::from("a"), ts, 2.0);
            s.insert(PvId::from("a"), ts, CAPACITY, 10.0);
        }
        (Arc::new(s), t0)
    }

    #[test]
    fn test_causal_view_hides_future() {
        let (source, t0) = source();
        let now = t0 + Duration::minutes(60);
        let view = without_future(source, now, Duration::minutes(15));
        let series = view
            .get(&[PvId::from("a")], t0, t0 + Duration::hours(5))
            .unwrap();
        assert!(series.rows().iter().all(|r| r.ts <= now - Duration::minutes(15)));
        assert_eq!(series.len(), 4);
    }

    #[test]
    fn test_causal_view_empty_when_range_is_in_future() {
        let (source, t0) = source();
        let view = without_future(source, t0, Duration::zero());
        let series = view
            .get(&[PvId::from("a")], t0 + Duration::minutes(1), t0 + Duration::hours(1))
            .unwrap();
        assert!(series.is_empty());
    }

    #[test]
    fn test_scaled_source_scales_power_and_capacity() {
        let (source, t0) = source();
        let scaled = ScaledPvDataSource::new(
            source,
            UnitConversion {
                power_factor: 3.0,
                capacity_factor: 0.5,
            },
        );
        let series = scaled.get(&[PvId::from("a")], t0, t0).unwrap();
        assert_eq!(series.last_value(POWER), Some(6.0));
        assert_eq!(series.last_value(CAPACITY), Some(5.0));
    }
}
