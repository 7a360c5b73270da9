use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;
use tempfile::Builder;

use crate::domain::EntityId;
use crate::error::HarvestError;

/// Folder of entity records, one file per id with no extension; the listing is the index.
#[derive(Debug, Clone)]
pub struct RecordStore {
    root: Utf8PathBuf,
}

impl RecordStore {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn ensure_root(&self) -> Result<(), HarvestError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))
    }

    pub fn record_path(&self, id: &EntityId) -> Utf8PathBuf {
        self.root.join(id.as_str())
    }

    pub fn exists(&self, id: &EntityId) -> bool {
        self.record_path(id).as_std_path().is_file()
    }

    pub fn all_exist(&self, ids: &[EntityId]) -> bool {
        ids.iter().all(|id| self.exists(id))
    }

    pub fn write_record(&self, id: &EntityId, record: &Value) -> Result<(), HarvestError> {
        let content =
            serde_json::to_vec(record).map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        write_bytes_atomic(&self.record_path(id), &content)
    }

    pub fn read_record(&self, id: &EntityId) -> Result<Value, HarvestError> {
        let content = fs::read(self.record_path(id).as_std_path())
            .map_err(|err| HarvestError::Filesystem(format!("read record {id}: {err}")))?;
        serde_json::from_slice(&content)
            .map_err(|err| HarvestError::Filesystem(format!("decode record {id}: {err}")))
    }

    pub fn list_ids(&self) -> Result<Vec<EntityId>, HarvestError> {
        if !self.root.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(self.root.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| HarvestError::Filesystem(err.to_string()))?;
            if !entry.path().is_file() {
                continue;
            }
            if let Some(id) = entry.file_name().to_str().and_then(|name| name.parse().ok()) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Writes through a sibling temp file and renames it into place.
pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), HarvestError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or(Utf8Path::new("."));
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix(".wdtools-")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    Ok(())
}
