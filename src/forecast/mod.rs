//! Forecast evaluation

pub mod metrics;

pub use metrics::{
    evaluate, metric_from_name, ErrorRecord, ErrorTable, ForecastMetrics, HorizonSummary,
    MeanAbsoluteError, MeanRelativeError, Metric, MetricError,
};
