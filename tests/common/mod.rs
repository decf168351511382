//! Synthetic PV fleet shared by the integration tests.

#![allow(dead_code)]

use chrono::{Datelike, Duration, TimeZone, Timelike, Utc};
use std::sync::Arc;

use pv_site_prediction::data::{InMemoryPvDataSource, PvDataSource, CAPACITY};
use pv_site_prediction::domain::{PvId, Timestamp};

pub const NUM_SITES: usize = 10;

pub fn data_start() -> Timestamp {
    Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap()
}

pub fn data_end() -> Timestamp {
    Utc.with_ymd_and_hms(2021, 2, 20, 0, 0, 0).unwrap()
}

pub fn site(i: usize) -> PvId {
    PvId::from(format!("pv_{i:02}"))
}

/// Bell between 06:00 and 18:00, scaled by the site capacity and a
/// day-dependent cloudiness factor.
pub fn power_at(capacity: f64, ts: Timestamp) -> f64 {
    let hour = ts.hour() as f64 + ts.minute() as f64 / 60.0;
    let shape = (std::f64::consts::PI * (hour - 6.0) / 12.0).sin().max(0.0);
    let clouds = 0.6 + 0.04 * ((ts.ordinal() * 37) % 11) as f64;
    capacity * shape * clouds
}

pub fn capacity(i: usize) -> f64 {
    1.0 + i as f64 * 0.5
}

/// Fifteen-minute power and capacity for `NUM_SITES` sites over fifty days.
pub fn fleet() -> InMemoryPvDataSource {
    let mut source = InMemoryPvDataSource::new();
    for i in 0..NUM_SITES {
        let mut ts = data_start();
        while ts < data_end() {
            source.insert_power(site(i), ts, power_at(capacity(i), ts));
            if ts.minute() == 0 && ts.hour() == 0 {
                source.insert(site(i), ts, CAPACITY, capacity(i));
            }
            ts += Duration::minutes(15);
        }
    }
    source
}

pub fn shared_fleet() -> Arc<dyn PvDataSource> {
    Arc::new(fleet())
}
