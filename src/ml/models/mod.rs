//! PV site model contracts
//!
//! Feature extraction is split from prediction so that samples can be built
//! on worker threads while the model itself stays on the orchestrating thread.

use serde::{Deserialize, Serialize};

use super::FeatureVector;
use crate::data::DataSources;
use crate::dataset::Sample;
use crate::domain::{Horizons, PvX, PvY};
use crate::error::Result;

pub mod recent_history;

pub use recent_history::{RecentHistoryConfig, RecentHistoryModel};

/// Configuration every PV site model exposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PvSiteModelConfig {
    pub horizons: Horizons,
}

/// Computes the features of one model input.
pub trait GetFeatures: Send + Sync {
    fn get_features(&self, x: &PvX) -> Result<FeatureVector>;
}

/// Inference capabilities of a PV site model.
pub trait PvSiteModel: GetFeatures {
    fn config(&self) -> &PvSiteModelConfig;

    fn predict_from_features(&self, x: &PvX, features: &FeatureVector) -> Result<PvY>;

    /// Replace the data sources used for feature extraction.
    fn set_data_sources(&mut self, sources: &DataSources);

    fn predict(&self, x: &PvX) -> Result<PvY> {
        let features = self.get_features(x)?;
        self.predict_from_features(x, &features)
    }
}

/// Summary of a training run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub train_samples: usize,
    pub valid_samples: usize,
    pub valid_mae: Option<f64>,
}

/// Stream of training batches, as produced by [`crate::dataset::Batches`].
pub type BatchIter<'a> = dyn Iterator<Item = Result<Vec<Sample>>> + 'a;

pub trait TrainablePvSiteModel: PvSiteModel {
    fn train(&mut self, train: &mut BatchIter<'_>, valid: &mut BatchIter<'_>) -> Result<TrainingReport>;
}
