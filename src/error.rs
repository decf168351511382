use thiserror::Error;

use crate::domain::{PvId, Timestamp};

pub type Result<T, E = PspError> = std::result::Result<T, E>;

/// Errors raised by the sampling, dispatch and evaluation core.
#[derive(Debug, Error)]
pub enum PspError {
    /// Not enough data to build a sample. Skipped by the sample generator.
    #[error("Missing data for {pv_id} at {ts}: {reason}")]
    MissingData {
        pv_id: PvId,
        ts: Timestamp,
        reason: String,
    },

    #[error("Split integrity violated: {0}")]
    SplitIntegrity(String),

    #[error("No model covers {ts}: {reason}")]
    DispatchCoverage { ts: Timestamp, reason: String },

    #[error("Unit mismatch: series in {series}, metadata in {metadata}")]
    UnitMismatch { series: String, metadata: String },

    #[error("Run interrupted after {completed} items")]
    Interrupted { completed: usize },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Sample worker failed: {0}")]
    Worker(String),

    #[error(transparent)]
    Metric(#[from] crate::forecast::MetricError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl PspError {
    pub fn missing_data(pv_id: &PvId, ts: Timestamp, reason: impl Into<String>) -> Self {
        PspError::MissingData {
            pv_id: pv_id.clone(),
            ts,
            reason: reason.into(),
        }
    }

    /// Whether a sample generator may drop the candidate and move on.
    pub fn is_skippable(&self) -> bool {
        matches!(self, PspError::MissingData { .. })
    }
}
