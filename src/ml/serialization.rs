//! Model persistence
//!
//! Models are stored with bincode. Data sources are never part of the
//! artifact; call `set_data_sources` after loading.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::info;

use crate::error::{PspError, Result};

/// Write `model` to `path`, going through a temporary sibling file so a
/// crash never leaves a truncated artifact behind.
pub fn save_model<M: Serialize>(model: &M, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .ok_or_else(|| PspError::InvalidInput(format!("{} is not a file path", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

    {
        let mut writer = BufWriter::new(fs::File::create(&tmp)?);
        bincode::serialize_into(&mut writer, model)?;
        writer.flush()?;
    }
    fs::rename(&tmp, path)?;

    info!(path = %path.display(), "saved model");
    Ok(())
}

pub fn load_model<M: DeserializeOwned>(path: impl AsRef<Path>) -> Result<M> {
    let path = path.as_ref();
    let reader = BufReader::new(fs::File::open(path)?);
    let model = bincode::deserialize_from(reader)?;
    info!(path = %path.display(), "loaded model");
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Horizons;
    use crate::ml::models::{PvSiteModel, RecentHistoryConfig, RecentHistoryModel};

    #[test]
    fn test_save_load_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exp").join("model_0.bin");

        let mut model = RecentHistoryModel::new(Horizons::uniform(30, 4).unwrap(), RecentHistoryConfig::default());
        model.scales = vec![0.5, 1.0, 1.5, 2.0];
        save_model(&model, &path).unwrap();

        let loaded: RecentHistoryModel = load_model(&path).unwrap();
        assert_eq!(loaded.scales, model.scales);
        assert_eq!(loaded.metadata.model_id, model.metadata.model_id);
        assert_eq!(loaded.config().horizons, model.config().horizons);
        // Sources are not persisted.
        assert!(loaded.feature_extractor().is_err());

        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("model_0.bin")]);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result: Result<RecentHistoryModel> = load_model(dir.path().join("nope.bin"));
        assert!(matches!(result, Err(PspError::Io(_))));
    }

    #[test]
    fn test_load_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.bin");
        std::fs::write(&path, b"\x01").unwrap();
        let result: Result<RecentHistoryModel> = load_model(&path);
        assert!(result.is_err());
    }
}
