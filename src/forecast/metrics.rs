//! Forecast Metrics and Evaluation
//!
//! Per-horizon error metrics, the error table written by evaluation runs and
//! aggregate accuracy summaries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::domain::{Horizons, PvId, PvX, PvY, Timestamp};

/// A per-horizon error metric.
pub trait Metric: Send + Sync {
    fn name(&self) -> &str;

    /// One error per horizon, index-aligned with `y` and `pred`.
    fn compute(&self, y: &PvY, pred: &PvY) -> Result<Vec<f64>, MetricError>;
}

fn check_dimensions(y: &PvY, pred: &PvY) -> Result<(), MetricError> {
    if y.len() != pred.len() {
        return Err(MetricError::DimensionMismatch {
            actual: y.len(),
            predicted: pred.len(),
        });
    }
    Ok(())
}

/// `|pred - y|`
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanAbsoluteError;

impl Metric for MeanAbsoluteError {
    fn name(&self) -> &str {
        "mae"
    }

    fn compute(&self, y: &PvY, pred: &PvY) -> Result<Vec<f64>, MetricError> {
        check_dimensions(y, pred)?;
        Ok(y.powers
            .iter()
            .zip(&pred.powers)
            .map(|(a, p)| (p - a).abs())
            .collect())
    }
}

/// `|pred - y| / max(|y|, cap)`
#[derive(Debug, Clone, Copy)]
pub struct MeanRelativeError {
    /// Smallest denominator, keeps night-time errors finite.
    pub cap: f64,
}

impl Default for MeanRelativeError {
    fn default() -> Self {
        Self { cap: 0.1 }
    }
}

impl Metric for MeanRelativeError {
    fn name(&self) -> &str {
        "mre"
    }

    fn compute(&self, y: &PvY, pred: &PvY) -> Result<Vec<f64>, MetricError> {
        check_dimensions(y, pred)?;
        Ok(y.powers
            .iter()
            .zip(&pred.powers)
            .map(|(a, p)| (p - a).abs() / a.abs().max(self.cap))
            .collect())
    }
}

/// Build a metric from its name.
pub fn metric_from_name(name: &str, mre_cap: f64) -> Result<Box<dyn Metric>, MetricError> {
    match name {
        "mae" => Ok(Box::new(MeanAbsoluteError)),
        "mre" => {
            if mre_cap <= 0.0 {
                return Err(MetricError::InvalidParameter(format!(
                    "mre cap must be positive, got {mre_cap}"
                )));
            }
            Ok(Box::new(MeanRelativeError { cap: mre_cap }))
        }
        other => Err(MetricError::UnknownMetric(other.to_string())),
    }
}

/// Evaluate every metric on one sample.
pub fn evaluate(
    y: &PvY,
    pred: &PvY,
    metrics: &[Box<dyn Metric>],
) -> Result<Vec<(String, Vec<f64>)>, MetricError> {
    metrics
        .iter()
        .map(|m| Ok((m.name().to_string(), m.compute(y, pred)?)))
        .collect()
}

// ============================================================================
// Error table
// ============================================================================

/// One row of an evaluation error file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub pv_id: PvId,
    pub ts: Timestamp,
    pub metric: String,
    pub error: f64,
    /// Start of the horizon, in minutes after `ts`.
    pub horizon: i64,
    pub y: f64,
    pub pred: f64,
    pub capacity: Option<f64>,
}

/// Accumulates error rows over an evaluation run.
pub struct ErrorTable {
    horizons: Horizons,
    metrics: Vec<Box<dyn Metric>>,
    rows: Vec<ErrorRecord>,
}

impl ErrorTable {
    pub fn new(horizons: Horizons, metrics: Vec<Box<dyn Metric>>) -> Self {
        Self {
            horizons,
            metrics,
            rows: Vec::new(),
        }
    }

    pub fn rows(&self) -> &[ErrorRecord] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Add one row per (metric, horizon) for a sample.
    pub fn push_sample(
        &mut self,
        x: &PvX,
        y: &PvY,
        pred: &PvY,
        capacity: Option<f64>,
    ) -> Result<(), MetricError> {
        if y.len() != self.horizons.len() {
            return Err(MetricError::DimensionMismatch {
                actual: y.len(),
                predicted: self.horizons.len(),
            });
        }
        for (name, errors) in evaluate(y, pred, &self.metrics)? {
            for (i, error) in errors.into_iter().enumerate() {
                self.rows.push(ErrorRecord {
                    pv_id: x.pv_id.clone(),
                    ts: x.ts,
                    metric: name.clone(),
                    error,
                    horizon: self.horizons.get(i).map_or(0, |h| h.start_minutes),
                    y: y.powers[i],
                    pred: pred.powers[i],
                    capacity,
                });
            }
        }
        Ok(())
    }

    /// Write all rows as CSV, replacing any existing file.
    pub fn write_csv(&self, path: impl AsRef<Path>) -> crate::error::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        for row in &self.rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        info!(path = %path.display(), rows = self.rows.len(), "wrote error table");
        Ok(())
    }

    /// Accuracy per (metric, horizon), ordered by metric then horizon.
    pub fn summary(&self) -> Vec<HorizonSummary> {
        let mut groups: BTreeMap<(String, i64), (Vec<f64>, Vec<f64>, f64)> = BTreeMap::new();
        for row in &self.rows {
            let (actual, predicted, error_sum) = groups
                .entry((row.metric.clone(), row.horizon))
                .or_default();
            actual.push(row.y);
            predicted.push(row.pred);
            *error_sum += row.error;
        }
        groups
            .into_iter()
            .filter_map(|((metric, horizon), (actual, predicted, error_sum))| {
                let forecast = ForecastMetrics::calculate(&actual, &predicted).ok()?;
                Some(HorizonSummary {
                    metric,
                    horizon,
                    mean_error: error_sum / actual.len() as f64,
                    forecast,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HorizonSummary {
    pub metric: String,
    pub horizon: i64,
    /// Mean of the metric's errors.
    pub mean_error: f64,
    pub forecast: ForecastMetrics,
}

/// Forecast accuracy metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastMetrics {
    /// Mean Absolute Error
    pub mae: f64,
    /// Root Mean Square Error
    pub rmse: f64,
    /// R² (coefficient of determination)
    pub r2: f64,
    /// Number of samples evaluated
    pub sample_count: usize,
}

impl ForecastMetrics {
    /// Calculate metrics from actual and predicted values
    pub fn calculate(actual: &[f64], predicted: &[f64]) -> Result<Self, MetricError> {
        if actual.len() != predicted.len() {
            return Err(MetricError::DimensionMismatch {
                actual: actual.len(),
                predicted: predicted.len(),
            });
        }

        if actual.is_empty() {
            return Err(MetricError::EmptyData);
        }

        let n = actual.len() as f64;
        let squared: f64 = actual
            .iter()
            .zip(predicted)
            .map(|(a, p)| (a - p).powi(2))
            .sum();
        let mae = actual
            .iter()
            .zip(predicted)
            .map(|(a, p)| (a - p).abs())
            .sum::<f64>()
            / n;
        let rmse = (squared / n).sqrt();

        let mean_actual = actual.iter().sum::<f64>() / n;
        let total_variance: f64 = actual.iter().map(|a| (a - mean_actual).powi(2)).sum();
        let r2 = if total_variance > 1e-10 {
            1.0 - squared / total_variance
        } else {
            0.0
        };

        Ok(ForecastMetrics {
            mae,
            rmse,
            r2,
            sample_count: actual.len(),
        })
    }
}

impl fmt::Display for ForecastMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MAE={:.3}, RMSE={:.3}, R²={:.3}, n={}",
            self.mae, self.rmse, self.r2, self.sample_count
        )
    }
}

/// Forecast metrics calculation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum MetricError {
    #[error("Dimension mismatch: actual={actual}, predicted={predicted}")]
    DimensionMismatch { actual: usize, predicted: usize },

    #[error("Empty data provided")]
    EmptyData,

    #[error("Unknown metric: {0}")]
    UnknownMetric(String),

    #[error("Invalid metric parameter: {0}")]
    InvalidParameter(String),
}
