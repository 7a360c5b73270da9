use std::collections::HashSet;
use std::fs::File;

use camino::Utf8Path;
use serde::Serialize;

use crate::domain::{EntityId, Language, strip_entity_uri};
use crate::error::HarvestError;
use crate::export::TableSink;
use crate::geometry::{BoundingBox, tile_bounding_box};
use crate::labels::LabelCache;
use crate::query::{EntitySource, LabelSource, PROPS_CLAIMS_LABELS, QuerySource, Table};
use crate::sparql::{
    ID_COLUMN, INSTANCE_OF_COLUMN, INSTANCE_OF_ID_COLUMN, bbox_query, instance_of_query,
};
use crate::store::{RecordStore, write_bytes_atomic};

pub type IdPage = Result<Vec<EntityId>, HarvestError>;

/// Where the identifiers of a collection run come from.
pub enum IdentifierSource<'a> {
    Single(EntityId),
    /// Split into chunks of [`CollectOptions::chunk_size`].
    Batch(Vec<EntityId>),
    /// Pages from an upstream reader, each page collected as one chunk.
    Paged(Box<dyn Iterator<Item = IdPage> + 'a>),
}

impl<'a> IdentifierSource<'a> {
    pub fn paged<I>(pages: I) -> Self
    where
        I: IntoIterator<Item = IdPage>,
        I::IntoIter: 'a,
    {
        IdentifierSource::Paged(Box::new(pages.into_iter()))
    }

    fn into_chunks(self, chunk_size: usize) -> Box<dyn Iterator<Item = IdPage> + 'a> {
        match self {
            IdentifierSource::Single(id) => Box::new(std::iter::once(Ok(vec![id]))),
            IdentifierSource::Batch(ids) => {
                let chunks = ids
                    .chunks(chunk_size)
                    .map(|chunk| Ok(chunk.to_vec()))
                    .collect::<Vec<_>>();
                Box::new(chunks.into_iter())
            }
            IdentifierSource::Paged(pages) => pages,
        }
    }
}

impl From<EntityId> for IdentifierSource<'_> {
    fn from(id: EntityId) -> Self {
        IdentifierSource::Single(id)
    }
}

impl From<Vec<EntityId>> for IdentifierSource<'_> {
    fn from(ids: Vec<EntityId>) -> Self {
        IdentifierSource::Batch(ids)
    }
}

#[derive(Debug, Clone)]
pub struct CollectOptions {
    pub language: Language,
    pub overwrite: bool,
    pub chunk_size: usize,
    pub props: String,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            language: Language::default(),
            overwrite: false,
            chunk_size: 50,
            props: PROPS_CLAIMS_LABELS.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectReport {
    pub destination: String,
    pub chunks_total: usize,
    pub chunks_skipped: usize,
    pub chunks_failed: usize,
    pub records_written: usize,
    pub records_existing: usize,
    pub records_empty: usize,
    pub failed_ids: Vec<EntityId>,
    pub started_at: String,
    pub finished_at: String,
}

impl CollectReport {
    /// One id per line; the file can be fed back as an id list in a later run.
    pub fn write_failed_manifest(&self, path: &Utf8Path) -> Result<(), HarvestError> {
        let mut content = String::new();
        for id in &self.failed_ids {
            content.push_str(id.as_str());
            content.push('\n');
        }
        write_bytes_atomic(path, content.as_bytes())
    }
}

pub struct Collector<S: EntitySource> {
    source: S,
    store: RecordStore,
}

impl<S: EntitySource> Collector<S> {
    pub fn new(source: S, store: RecordStore) -> Self {
        Self { source, store }
    }

    /// Fetches every chunk not already fully present in the store and writes one file per record.
    ///
    /// A chunk that cannot be fetched is logged and listed in the report; nothing is written
    /// for it, so a later run picks it up again.
    pub fn collect(
        &self,
        ids: IdentifierSource<'_>,
        options: &CollectOptions,
    ) -> Result<CollectReport, HarvestError> {
        if options.chunk_size == 0 {
            return Err(HarvestError::InvalidIdentifierSource(
                "chunk size must be at least 1".to_string(),
            ));
        }
        self.store.ensure_root()?;

        let mut report = CollectReport {
            destination: self.store.root().to_string(),
            started_at: chrono::Utc::now().to_rfc3339(),
            ..CollectReport::default()
        };

        for (index, page) in ids.into_chunks(options.chunk_size).enumerate() {
            report.chunks_total += 1;
            let chunk = match page {
                Ok(chunk) => chunk,
                Err(err) => {
                    tracing::error!(chunk = index, error = %err, "failed to read identifier page");
                    report.chunks_failed += 1;
                    continue;
                }
            };
            if chunk.is_empty() {
                continue;
            }
            self.collect_chunk(index, chunk, options, &mut report);
        }

        report.finished_at = chrono::Utc::now().to_rfc3339();
        tracing::info!(
            destination = %report.destination,
            chunks = report.chunks_total,
            skipped = report.chunks_skipped,
            failed = report.chunks_failed,
            written = report.records_written,
            "collection finished"
        );
        Ok(report)
    }

    fn collect_chunk(
        &self,
        index: usize,
        mut chunk: Vec<EntityId>,
        options: &CollectOptions,
        report: &mut CollectReport,
    ) {
        let mut seen = HashSet::new();
        chunk.retain(|id| seen.insert(id.clone()));

        if !options.overwrite && self.store.all_exist(&chunk) {
            tracing::debug!(chunk = index, size = chunk.len(), "chunk already collected");
            report.chunks_skipped += 1;
            report.records_existing += chunk.len();
            return;
        }

        let mut bundle = match self
            .source
            .fetch_entities(&chunk, &options.language, &options.props)
        {
            Ok(Some(bundle)) => bundle,
            Ok(None) => {
                tracing::warn!(chunk = index, first = %chunk[0], "no response for chunk, skipping");
                report.chunks_failed += 1;
                report.failed_ids.extend(chunk);
                return;
            }
            Err(err) => {
                tracing::error!(chunk = index, first = %chunk[0], error = %err, "chunk request failed");
                report.chunks_failed += 1;
                report.failed_ids.extend(chunk);
                return;
            }
        };

        for id in &chunk {
            let record = match bundle.entities.remove(id) {
                Some(Some(record)) => record,
                Some(None) => {
                    report.records_empty += 1;
                    continue;
                }
                None => {
                    // Usually a redirect: the response is keyed by the target id.
                    tracing::warn!(chunk = index, id = %id, "requested id missing from response");
                    report.failed_ids.push(id.clone());
                    continue;
                }
            };
            if !options.overwrite && self.store.exists(id) {
                report.records_existing += 1;
                continue;
            }
            match self.store.write_record(id, &record) {
                Ok(()) => report.records_written += 1,
                Err(err) => {
                    tracing::error!(id = %id, error = %err, "failed to write record");
                    report.failed_ids.push(id.clone());
                }
            }
        }
        if !bundle.entities.is_empty() {
            tracing::debug!(
                chunk = index,
                unrequested = bundle.entities.len(),
                "ignoring entities that were not requested"
            );
        }
        tracing::info!(chunk = index, size = chunk.len(), "chunk collected");
    }
}

/// Lazily reads a headerless single-column id file in pages of `chunk_size`.
pub struct IdChunks {
    records: csv::StringRecordsIntoIter<File>,
    chunk_size: usize,
    done: bool,
}

impl Iterator for IdChunks {
    type Item = IdPage;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut page = Vec::with_capacity(self.chunk_size);
        while page.len() < self.chunk_size {
            let Some(record) = self.records.next() else {
                self.done = true;
                break;
            };
            let record = match record {
                Ok(record) => record,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err.into()));
                }
            };
            let Some(value) = record.get(0).map(str::trim).filter(|value| !value.is_empty())
            else {
                continue;
            };
            match EntityId::from_uri(value) {
                Ok(id) => page.push(id),
                Err(err) => tracing::warn!(value = %value, error = %err, "skipping invalid id"),
            }
        }
        if page.is_empty() && self.done {
            return None;
        }
        Some(Ok(page))
    }
}

pub fn read_id_chunks(path: &Utf8Path, chunk_size: usize) -> Result<IdChunks, HarvestError> {
    if chunk_size == 0 {
        return Err(HarvestError::InvalidIdentifierSource(
            "chunk size must be at least 1".to_string(),
        ));
    }
    let reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path.as_std_path())?;
    Ok(IdChunks {
        records: reader.into_records(),
        chunk_size,
        done: false,
    })
}

/// Ids of every instance of `class` (including subclasses), cached at `filepath`.
///
/// The query only runs when the file is absent or `overwrite` is set.
pub fn instance_of_ids<Q: QuerySource>(
    query: &Q,
    class: &EntityId,
    filepath: &Utf8Path,
    overwrite: bool,
    chunk_size: usize,
) -> Result<IdChunks, HarvestError> {
    if overwrite || !filepath.as_std_path().exists() {
        let table = query.run_query(&instance_of_query(class))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        let mut count = 0usize;
        for value in table.column_values(ID_COLUMN).into_iter().flatten() {
            writer.write_record([strip_entity_uri(value)])?;
            count += 1;
        }
        let content = writer
            .into_inner()
            .map_err(|err| HarvestError::Csv(err.to_string()))?;
        write_bytes_atomic(filepath, &content)?;
        tracing::info!(class = %class, count, path = %filepath, "instance ids written");
    } else {
        tracing::debug!(path = %filepath, "using cached instance ids");
    }
    read_id_chunks(filepath, chunk_size)
}

/// Items located in `bbox` with their `instance of` ids, entity URIs stripped.
pub fn bbox_table<Q: QuerySource>(query: &Q, bbox: &BoundingBox) -> Result<Table, HarvestError> {
    let mut table = query.run_query(&bbox_query(bbox))?;
    table.map_column(ID_COLUMN, |value| Some(strip_entity_uri(value).to_string()));
    table.map_column(INSTANCE_OF_ID_COLUMN, |value| {
        Some(strip_entity_uri(value).to_string())
    });
    Ok(table)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BboxReport {
    pub tiles: usize,
    pub rows: usize,
    pub labels_cached: usize,
}

/// Queries `bbox` tile by tile, labels each row's class and streams the tiles into `sink`.
///
/// The first tile replaces the sink's contents, later tiles append. The label cache is
/// flushed after every tile.
pub fn bbox_to_sink<Q, L>(
    query: &Q,
    labels: &mut LabelCache<L>,
    bbox: BoundingBox,
    n_splits: usize,
    sink: &mut dyn TableSink,
) -> Result<BboxReport, HarvestError>
where
    Q: QuerySource,
    L: LabelSource,
{
    let tiles = tile_bounding_box(bbox, n_splits, 0.0);
    let total = tiles.len();
    let mut report = BboxReport::default();

    for (index, tile) in tiles.enumerate() {
        tracing::debug!(tile = index + 1, total, bbox = %tile, "querying bounding box");
        let mut table = bbox_table(query, &tile)?;
        let class_index = table.column_index(INSTANCE_OF_ID_COLUMN);
        table.push_column(INSTANCE_OF_COLUMN, |row| {
            let value = row.get(class_index?)?.as_deref()?;
            let id = value.parse::<EntityId>().ok()?;
            labels.get(&id).map(str::to_string)
        });

        sink.write_table(&table, index > 0)?;
        labels.save()?;
        report.tiles += 1;
        report.rows += table.len();
    }
    report.labels_cached = labels.len();
    Ok(report)
}
