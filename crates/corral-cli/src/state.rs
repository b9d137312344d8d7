//! File-backed instance store: the byte sink the session registry
//! persists into.

use std::path::PathBuf;

use anyhow::{Context, Result};
use corral_session::storage::InstanceStore;

use crate::config::Paths;

/// Stores the serialized instance list at `<home>/state.json`, writing
/// atomically via rename.
pub struct AppState {
    state_file: PathBuf,
}

impl AppState {
    pub fn new(paths: &Paths) -> Self {
        Self {
            state_file: paths.state_file.clone(),
        }
    }

    fn write_atomic(&self, data: &[u8]) -> Result<()> {
        if let Some(parent) = self.state_file.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp_path = self.state_file.with_extension("json.tmp");
        std::fs::write(&tmp_path, data)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.state_file)
            .with_context(|| format!("failed to replace {}", self.state_file.display()))?;
        Ok(())
    }
}

impl InstanceStore for AppState {
    fn save_instances(&self, data: &[u8]) -> Result<()> {
        self.write_atomic(data)
    }

    fn get_instances(&self) -> Vec<u8> {
        std::fs::read(&self.state_file).unwrap_or_else(|_| b"[]".to_vec())
    }

    fn delete_all_instances(&self) -> Result<()> {
        self.write_atomic(b"[]")
    }
}
