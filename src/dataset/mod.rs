//! Turning raw PV series into labelled samples.

use serde::{Deserialize, Serialize};

use crate::domain::{PvX, PvY};
use crate::ml::FeatureVector;

pub mod loader;
pub mod sampler;
pub mod splits;

pub use loader::{Batches, SampleBuilder, SampleGenerator, SampleStats, SampleStream};
pub use sampler::{substream_seed, CandidateGrid, Candidates, SamplingPolicy};
pub use splits::{pv_list_to_short_str, split_train_test, DateSplits, PvSplits, SplitConfig, SplitName};

/// One training or evaluation example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub x: PvX,
    /// Ground truth, one value per horizon.
    pub y: PvY,
    pub features: FeatureVector,
}
