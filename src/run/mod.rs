//! Training and evaluation runs
//!
//! A run is single-threaded orchestration over the library pieces; only the
//! sample generator spawns threads. Both runs honour a [`StopFlag`](crate::telemetry::StopFlag).

use std::path::{Path, PathBuf};

use crate::dataset::SplitName;

pub mod eval;
pub mod train;

pub use eval::{run_eval, EvalOptions, EvalSummary};
pub use train::{run_train, TrainOptions, TrainSummary};

/// Artifact of the model trained up to cutoff `index`.
pub fn model_path(exp_dir: &Path, index: usize) -> PathBuf {
    exp_dir.join(format!("model_{index}.bin"))
}

pub fn errors_path(exp_dir: &Path, split: SplitName) -> PathBuf {
    exp_dir.join(format!("{split}_errors.csv"))
}

pub fn summary_path(exp_dir: &Path, split: SplitName) -> PathBuf {
    exp_dir.join(format!("{split}_summary.json"))
}
