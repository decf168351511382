//! Machine Learning Module
//!
//! Contracts for PV site models and the pieces built around them:
//! - Feature vectors and model metadata
//! - Model traits (feature extraction, prediction, training)
//! - A baseline model trained from recent history
//! - The per-date multi-model dispatcher
//! - Model persistence

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PspError, Result};

pub mod models;
pub mod multi;
pub mod serialization;

pub use models::{
    BatchIter, GetFeatures, PvSiteModel, PvSiteModelConfig, TrainablePvSiteModel, TrainingReport,
};
pub use multi::{DispatchPolicy, FallbackPolicy, MultiPvSiteModel};
pub use serialization::{load_model, save_model};

/// Model metadata, stored alongside the trained parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub model_id: String,
    pub version: String,
    pub trained_at: Option<DateTime<Utc>>,
    /// Latest timestamp whose data was used for training.
    pub cutoff: Option<DateTime<Utc>>,
    pub training_samples: usize,
    pub validation_mae: Option<f64>,
    pub feature_names: Vec<String>,
}

/// Feature Vector for ML models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub features: Vec<f64>,
    pub feature_names: Vec<String>,
}

impl FeatureVector {
    pub fn new(features: Vec<f64>, feature_names: Vec<String>) -> Result<Self> {
        if features.len() != feature_names.len() {
            return Err(PspError::Model(format!(
                "Feature count mismatch: {} features, {} names",
                features.len(),
                feature_names.len()
            )));
        }
        Ok(Self {
            features,
            feature_names,
        })
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Value of the feature called `name`.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.feature_names
            .iter()
            .position(|n| n == name)
            .map(|i| self.features[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_vector_creation() {
        let features = vec![1.0, 2.0, 3.0];
        let names = vec!["f1".to_string(), "f2".to_string(), "f3".to_string()];

        let fv = FeatureVector::new(features, names).unwrap();
        assert_eq!(fv.len(), 3);
        assert!(!fv.is_empty());
        assert_eq!(fv.get("f2"), Some(2.0));
        assert_eq!(fv.get("f4"), None);
    }

    #[test]
    fn test_feature_vector_mismatch() {
        let result = FeatureVector::new(vec![1.0], vec![]);
        assert!(matches!(result, Err(PspError::Model(_))));
    }
}
