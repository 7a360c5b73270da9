use std::collections::VecDeque;
use std::sync::Mutex;

use camino::Utf8PathBuf;
use serde_json::{Value, json};

use wdtools::collect::{
    CollectOptions, Collector, IdentifierSource, bbox_to_sink, instance_of_ids, read_id_chunks,
};
use wdtools::config::Config;
use wdtools::domain::{EntityId, Language};
use wdtools::error::HarvestError;
use wdtools::export::CsvSink;
use wdtools::geometry::BoundingBox;
use wdtools::labels::LabelCache;
use wdtools::query::{
    EntityBundle, EntitySource, LabelSource, QuerySource, Table, WikidataClient,
};
use wdtools::store::RecordStore;
use wdtools::transport::{HttpResponse, Transport};

struct MockApi {
    body: String,
    calls: Mutex<usize>,
}

impl Transport for MockApi {
    fn get(&self, _url: &str, _params: &[(&str, &str)]) -> Result<HttpResponse, HarvestError> {
        *self.calls.lock().unwrap() += 1;
        Ok(HttpResponse {
            status: 200,
            body: self.body.as_bytes().to_vec(),
        })
    }
}

/// Answers each requested id with a payload unless the id is listed as failing or empty.
#[derive(Default)]
struct MockEntities {
    failing: Vec<String>,
    empty: Vec<String>,
    /// Requested id answered under another id, the way redirected items come back.
    redirects: Vec<(String, String)>,
    requests: Mutex<Vec<Vec<String>>>,
}

impl MockEntities {
    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl EntitySource for MockEntities {
    fn fetch_entities(
        &self,
        ids: &[EntityId],
        _language: &Language,
        _props: &str,
    ) -> Result<Option<EntityBundle>, HarvestError> {
        self.requests
            .lock()
            .unwrap()
            .push(ids.iter().map(|id| id.to_string()).collect());
        if ids.iter().any(|id| self.failing.contains(&id.to_string())) {
            return Ok(None);
        }
        let mut bundle = EntityBundle::default();
        for id in ids {
            let payload = (!self.empty.contains(&id.to_string()))
                .then(|| json!({ "id": id.as_str(), "claims": {} }));
            let key = self
                .redirects
                .iter()
                .find(|(from, _)| *from == id.as_str())
                .map(|(_, to)| to.parse().unwrap())
                .unwrap_or_else(|| id.clone());
            bundle.entities.insert(key, payload);
        }
        Ok(Some(bundle))
    }
}

fn ids(values: &[&str]) -> Vec<EntityId> {
    values.iter().map(|value| value.parse().unwrap()).collect()
}

fn temp_store() -> (tempfile::TempDir, RecordStore) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().join("records")).unwrap();
    (temp, RecordStore::new(root))
}

fn options(chunk_size: usize) -> CollectOptions {
    CollectOptions {
        chunk_size,
        ..CollectOptions::default()
    }
}

#[test]
fn end_to_end_collect_then_resume_without_requests() {
    let (_temp, store) = temp_store();
    let api = MockApi {
        body: r#"{ "entities": {
            "Q1": { "id": "Q1", "labels": {}, "claims": {} },
            "Q2": { "id": "Q2", "labels": {}, "claims": {} }
        } }"#
            .to_string(),
        calls: Mutex::new(0),
    };
    let config = Config {
        retry_backoff_ms: 0,
        ..Config::default()
    };
    let client = WikidataClient::new(api, &config);
    let collector = Collector::new(&client, store.clone());

    let report = collector
        .collect(IdentifierSource::Batch(ids(&["Q1", "Q2"])), &options(50))
        .unwrap();
    assert_eq!(report.records_written, 2);
    assert!(store.record_path(&"Q1".parse().unwrap()).as_std_path().is_file());
    assert!(store.record_path(&"Q2".parse().unwrap()).as_std_path().is_file());
    assert_eq!(*client.transport().calls.lock().unwrap(), 1);

    let rerun = collector
        .collect(IdentifierSource::Batch(ids(&["Q1", "Q2"])), &options(50))
        .unwrap();
    assert_eq!(rerun.chunks_skipped, 1);
    assert_eq!(rerun.records_written, 0);
    assert_eq!(*client.transport().calls.lock().unwrap(), 1);

    let record: Value = store.read_record(&"Q2".parse().unwrap()).unwrap();
    assert_eq!(record["id"], "Q2");
}

#[test]
fn only_incomplete_chunks_are_fetched() {
    let (_temp, store) = temp_store();
    store.ensure_root().unwrap();
    for id in ids(&["Q1", "Q2", "Q3"]) {
        store.write_record(&id, &json!({ "id": id.as_str() })).unwrap();
    }
    let source = MockEntities::default();
    let collector = Collector::new(&source, store);

    let report = collector
        .collect(
            IdentifierSource::Batch(ids(&["Q1", "Q2", "Q3", "Q4"])),
            &options(2),
        )
        .unwrap();

    assert_eq!(report.chunks_total, 2);
    assert_eq!(report.chunks_skipped, 1);
    assert_eq!(source.request_count(), 1);
    assert_eq!(source.requests.lock().unwrap()[0], vec!["Q3", "Q4"]);
    assert_eq!(report.records_written, 1);
    assert_eq!(report.records_existing, 3);
}

#[test]
fn failed_chunk_writes_nothing_and_is_reported() {
    let (_temp, store) = temp_store();
    let source = MockEntities {
        failing: vec!["Q3".to_string()],
        ..MockEntities::default()
    };
    let collector = Collector::new(&source, store.clone());

    let report = collector
        .collect(
            IdentifierSource::Batch(ids(&["Q1", "Q2", "Q3", "Q4"])),
            &options(2),
        )
        .unwrap();

    assert_eq!(report.chunks_failed, 1);
    assert_eq!(report.failed_ids, ids(&["Q3", "Q4"]));
    assert!(store.exists(&"Q1".parse().unwrap()));
    assert!(!store.exists(&"Q4".parse().unwrap()));

    let manifest = store.root().join("failed.txt");
    report.write_failed_manifest(&manifest).unwrap();
    let retry: Vec<_> = read_id_chunks(&manifest, 10)
        .unwrap()
        .map(|page| page.unwrap())
        .collect();
    assert_eq!(retry, vec![ids(&["Q3", "Q4"])]);
}

#[test]
fn empty_payloads_are_skipped() {
    let (_temp, store) = temp_store();
    let source = MockEntities {
        empty: vec!["Q2".to_string()],
        ..MockEntities::default()
    };
    let collector = Collector::new(&source, store.clone());

    let report = collector
        .collect(IdentifierSource::Batch(ids(&["Q1", "Q2"])), &options(10))
        .unwrap();

    assert_eq!(report.records_written, 1);
    assert_eq!(report.records_empty, 1);
    assert!(report.failed_ids.is_empty());
    assert!(!store.exists(&"Q2".parse().unwrap()));
}

#[test]
fn repeated_ids_are_fetched_once() {
    let (_temp, store) = temp_store();
    let source = MockEntities::default();
    let collector = Collector::new(&source, store.clone());

    let report = collector
        .collect(IdentifierSource::Batch(ids(&["Q1", "Q1", "Q2"])), &options(10))
        .unwrap();

    assert_eq!(source.requests.lock().unwrap()[0], vec!["Q1", "Q2"]);
    assert_eq!(report.records_written, 2);
    assert_eq!(report.records_empty, 0);
    assert!(report.failed_ids.is_empty());
}

#[test]
fn ids_missing_from_response_are_reported() {
    let (_temp, store) = temp_store();
    let source = MockEntities {
        redirects: vec![("Q1".to_string(), "Q9".to_string())],
        ..MockEntities::default()
    };
    let collector = Collector::new(&source, store.clone());

    let report = collector
        .collect(IdentifierSource::Batch(ids(&["Q1", "Q2"])), &options(10))
        .unwrap();

    assert_eq!(report.records_written, 1);
    assert_eq!(report.records_empty, 0);
    assert_eq!(report.failed_ids, ids(&["Q1"]));
    assert!(!store.exists(&"Q1".parse().unwrap()));
    assert!(!store.exists(&"Q9".parse().unwrap()));
}

#[test]
fn overwrite_refetches_existing_records() {
    let (_temp, store) = temp_store();
    store.ensure_root().unwrap();
    let q1: EntityId = "Q1".parse().unwrap();
    store.write_record(&q1, &json!({ "stale": true })).unwrap();
    let source = MockEntities::default();
    let collector = Collector::new(&source, store.clone());

    let report = collector
        .collect(
            IdentifierSource::Single(q1.clone()),
            &CollectOptions {
                overwrite: true,
                ..CollectOptions::default()
            },
        )
        .unwrap();

    assert_eq!(source.request_count(), 1);
    assert_eq!(report.records_written, 1);
    assert_eq!(store.read_record(&q1).unwrap()["id"], "Q1");
}

#[test]
fn paged_source_keeps_going_after_bad_page() {
    let (_temp, store) = temp_store();
    let source = MockEntities::default();
    let collector = Collector::new(&source, store.clone());
    let pages = vec![
        Ok(ids(&["Q1"])),
        Err(HarvestError::Csv("broken line".to_string())),
        Ok(ids(&["Q2", "Q3"])),
    ];

    let report = collector
        .collect(IdentifierSource::paged(pages), &options(1))
        .unwrap();

    assert_eq!(report.chunks_total, 3);
    assert_eq!(report.chunks_failed, 1);
    assert_eq!(report.records_written, 3);
    assert_eq!(source.requests.lock().unwrap()[1], vec!["Q2", "Q3"]);
    assert_eq!(store.list_ids().unwrap(), ids(&["Q1", "Q2", "Q3"]));
}

#[test]
fn zero_chunk_size_is_rejected() {
    let (_temp, store) = temp_store();
    let source = MockEntities::default();
    let collector = Collector::new(&source, store);
    let result = collector.collect(IdentifierSource::Batch(ids(&["Q1"])), &options(0));
    assert!(matches!(result, Err(HarvestError::InvalidIdentifierSource(_))));
}

struct MockQuery {
    tables: Mutex<VecDeque<Table>>,
    queries: Mutex<Vec<String>>,
}

impl MockQuery {
    fn new(tables: Vec<Table>) -> Self {
        Self {
            tables: Mutex::new(tables.into()),
            queries: Mutex::new(Vec::new()),
        }
    }
}

impl QuerySource for MockQuery {
    fn run_query(&self, sparql: &str) -> Result<Table, HarvestError> {
        self.queries.lock().unwrap().push(sparql.to_string());
        self.tables
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(HarvestError::QueryEmpty)
    }
}

fn table(columns: &[&str], rows: &[&[&str]]) -> Table {
    let mut table = Table::new(columns.iter().map(|c| c.to_string()).collect());
    for row in rows {
        table
            .rows
            .push(row.iter().map(|cell| Some(cell.to_string())).collect());
    }
    table
}

#[test]
fn instance_ids_are_cached_on_disk() {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(temp.path().join("Q515.csv")).unwrap();
    let query = MockQuery::new(vec![table(
        &["wikidata_id"],
        &[
            &["http://www.wikidata.org/entity/Q64"],
            &["http://www.wikidata.org/entity/Q90"],
            &["http://www.wikidata.org/entity/Q84"],
        ],
    )]);
    let class: EntityId = "Q515".parse().unwrap();

    let pages: Vec<_> = instance_of_ids(&query, &class, &path, false, 2)
        .unwrap()
        .map(|page| page.unwrap())
        .collect();
    assert_eq!(pages, vec![ids(&["Q64", "Q90"]), ids(&["Q84"])]);
    assert_eq!(
        std::fs::read_to_string(path.as_std_path()).unwrap(),
        "Q64\nQ90\nQ84\n"
    );
    assert!(query.queries.lock().unwrap()[0].contains("wd:Q515"));

    let again: usize = instance_of_ids(&query, &class, &path, false, 10)
        .unwrap()
        .map(|page| page.unwrap().len())
        .sum();
    assert_eq!(again, 3);
    assert_eq!(query.queries.lock().unwrap().len(), 1);
}

struct MockLabels {
    calls: Mutex<usize>,
}

impl LabelSource for MockLabels {
    fn fetch_label(&self, id: &EntityId, _language: &Language) -> Option<String> {
        *self.calls.lock().unwrap() += 1;
        match id.as_str() {
            "Q515" => Some("city".to_string()),
            "Q532" => Some("village".to_string()),
            _ => None,
        }
    }
}

#[test]
fn bbox_tiles_are_labelled_and_appended() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let columns = ["wikidata_id", "instance_of_id", "geom"];
    let [q64, q1, q2, city, village] = ["Q64", "Q1", "Q2", "Q515", "Q532"]
        .map(|id| format!("http://www.wikidata.org/entity/{id}"));
    let query = MockQuery::new(vec![
        table(&columns, &[&[q64.as_str(), city.as_str(), "Point(13.38 52.52)"]]),
        table(
            &columns,
            &[
                &[q1.as_str(), village.as_str(), "Point(14 53)"],
                &[q2.as_str(), city.as_str(), "Point(14.5 53.5)"],
            ],
        ),
        table(&columns, &[]),
        table(&columns, &[]),
    ]);
    let labels_source = MockLabels {
        calls: Mutex::new(0),
    };
    let mut labels =
        LabelCache::open(root.join("labels.json"), Language::default(), &labels_source).unwrap();
    let mut sink = CsvSink::new(root.join("bbox.csv"));
    let bbox = BoundingBox::new(13.0, 52.0, 15.0, 54.0).unwrap();

    let report = bbox_to_sink(&query, &mut labels, bbox, 2, &mut sink).unwrap();

    assert_eq!(report.tiles, 4);
    assert_eq!(report.rows, 3);
    assert_eq!(*labels_source.calls.lock().unwrap(), 2);
    assert!(!labels.is_dirty());
    assert!(root.join("labels.json").as_std_path().exists());
    assert_eq!(
        std::fs::read_to_string(root.join("bbox.csv").as_std_path()).unwrap(),
        "wikidata_id,instance_of_id,geom,instance_of\n\
         Q64,Q515,Point(13.38 52.52),city\n\
         Q1,Q532,Point(14 53),village\n\
         Q2,Q515,Point(14.5 53.5),city\n"
    );
    assert!(query.queries.lock().unwrap()[0].contains("Point(13 52)"));
}
