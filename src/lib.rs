//! PV site power forecasting: sample generation, site splits, per-date model
//! dispatch and error evaluation.

pub mod config;
pub mod data;
pub mod dataset;
pub mod domain;
pub mod error;
pub mod forecast;
pub mod ml;
pub mod run;
pub mod telemetry;

pub use error::{PspError, Result};
