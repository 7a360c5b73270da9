//! Persistent id → label cache.
//!
//! Every miss is resolved once through a [`LabelSource`] and remembered, including misses
//! that resolved to no label. The cache file is rewritten as a whole on save; it records the
//! language it was filled with and refuses to open under another one.

use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::domain::{EntityId, Language};
use crate::error::HarvestError;
use crate::query::LabelSource;
use crate::store::write_bytes_atomic;

#[derive(Debug, Deserialize)]
struct LabelFile {
    language: Language,
    #[serde(default)]
    labels: BTreeMap<EntityId, Option<String>>,
}

pub struct LabelCache<S: LabelSource> {
    path: Utf8PathBuf,
    language: Language,
    labels: BTreeMap<EntityId, Option<String>>,
    source: S,
    dirty: bool,
}

impl<S: LabelSource> LabelCache<S> {
    /// Loads `path` if it exists, otherwise starts empty.
    pub fn open(
        path: impl Into<Utf8PathBuf>,
        language: Language,
        source: S,
    ) -> Result<Self, HarvestError> {
        let path = path.into();
        let labels = match read_label_file(&path)? {
            Some(file) if file.language != language => {
                return Err(HarvestError::LabelLanguageMismatch {
                    expected: language.to_string(),
                    found: file.language.to_string(),
                });
            }
            Some(file) => file.labels,
            None => BTreeMap::new(),
        };
        tracing::debug!(path = %path, entries = labels.len(), "label cache opened");
        Ok(Self {
            path,
            language,
            labels,
            source,
            dirty: false,
        })
    }

    /// Returns the cached label, resolving and remembering it on a miss.
    pub fn get(&mut self, id: &EntityId) -> Option<&str> {
        if !self.labels.contains_key(id) {
            let label = self.source.fetch_label(id, &self.language);
            if label.is_none() {
                tracing::debug!(id = %id, language = %self.language, "no label found");
            }
            self.labels.insert(id.clone(), label);
            self.dirty = true;
        }
        self.labels.get(id).and_then(|label| label.as_deref())
    }

    /// Looks up without touching the remote source; `Some(None)` is a remembered miss.
    pub fn peek(&self, id: &EntityId) -> Option<Option<&str>> {
        self.labels.get(id).map(|label| label.as_deref())
    }

    pub fn set(&mut self, id: EntityId, label: Option<String>) {
        self.labels.insert(id, label);
        self.dirty = true;
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.labels.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn language(&self) -> &Language {
        &self.language
    }

    /// Writes the whole mapping if anything changed; returns whether a write happened.
    pub fn save(&mut self) -> Result<bool, HarvestError> {
        if !self.dirty {
            return Ok(false);
        }
        let file = LabelFileRef {
            language: &self.language,
            labels: &self.labels,
        };
        let content = serde_json::to_vec(&file)
            .map_err(|err| HarvestError::LabelCacheFormat(err.to_string()))?;
        write_bytes_atomic(&self.path, &content)?;
        self.dirty = false;
        tracing::debug!(path = %self.path, entries = self.labels.len(), "label cache saved");
        Ok(true)
    }

    /// Flushes and releases the cache, surfacing write errors that `Drop` can only log.
    pub fn close(mut self) -> Result<(), HarvestError> {
        self.save().map(|_| ())
    }
}

impl<S: LabelSource> Drop for LabelCache<S> {
    fn drop(&mut self) {
        if let Err(err) = self.save() {
            tracing::error!(path = %self.path, error = %err, "failed to flush label cache");
        }
    }
}

#[derive(Serialize)]
struct LabelFileRef<'a> {
    language: &'a Language,
    labels: &'a BTreeMap<EntityId, Option<String>>,
}

fn read_label_file(path: &Utf8Path) -> Result<Option<LabelFile>, HarvestError> {
    if !path.as_std_path().exists() {
        return Ok(None);
    }
    let content = fs::read(path.as_std_path())
        .map_err(|err| HarvestError::Filesystem(format!("read {path}: {err}")))?;
    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|err| HarvestError::LabelCacheFormat(format!("{path}: {err}")))
}

/// Runs `f` with an open cache and flushes it afterwards, whether `f` succeeded or not.
pub fn with_label_cache<S, F, R>(
    path: impl Into<Utf8PathBuf>,
    language: Language,
    source: S,
    f: F,
) -> Result<R, HarvestError>
where
    S: LabelSource,
    F: FnOnce(&mut LabelCache<S>) -> Result<R, HarvestError>,
{
    let mut cache = LabelCache::open(path, language, source)?;
    let result = f(&mut cache);
    let closed = cache.close();
    let value = result?;
    closed?;
    Ok(value)
}
