use std::collections::{BTreeMap, HashMap};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Config;
use crate::domain::{EntityId, Language, join_ids};
use crate::error::HarvestError;
use crate::transport::{HttpTransport, Transport};

pub const PROPS_CLAIMS_LABELS: &str = "claims|labels";
pub const PROPS_LABELS: &str = "labels";

/// Tabular SPARQL result; every row has one cell per column.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    pub fn get(&self, row: usize, column: &str) -> Option<&str> {
        let index = self.column_index(column)?;
        self.rows.get(row)?.get(index)?.as_deref()
    }

    pub fn row_map(&self, row: usize) -> Option<BTreeMap<&str, Option<&str>>> {
        let cells = self.rows.get(row)?;
        Some(
            self.columns
                .iter()
                .map(String::as_str)
                .zip(cells.iter().map(|cell| cell.as_deref()))
                .collect(),
        )
    }

    pub fn column_values(&self, column: &str) -> Vec<Option<&str>> {
        match self.column_index(column) {
            Some(index) => self.rows.iter().map(|row| row[index].as_deref()).collect(),
            None => Vec::new(),
        }
    }

    /// Rewrites every non-null cell of `column` in place.
    pub fn map_column<F>(&mut self, column: &str, mut f: F)
    where
        F: FnMut(&str) -> Option<String>,
    {
        let Some(index) = self.column_index(column) else {
            return;
        };
        for row in &mut self.rows {
            if let Some(value) = row[index].take() {
                row[index] = f(&value);
            }
        }
    }

    /// Appends a column computed from each row.
    pub fn push_column<F>(&mut self, name: &str, mut f: F)
    where
        F: FnMut(&[Option<String>]) -> Option<String>,
    {
        for row in &mut self.rows {
            let value = f(row);
            row.push(value);
        }
        self.columns.push(name.to_string());
    }
}

/// Entity payloads keyed by id; `None` marks an id the API knows but returned nothing for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityBundle {
    pub entities: BTreeMap<EntityId, Option<Value>>,
}

impl EntityBundle {
    pub fn from_response(value: Value) -> Result<Self, HarvestError> {
        let Value::Object(mut root) = value else {
            return Err(HarvestError::Encoding("response is not a JSON object".to_string()));
        };
        let entities = match root.remove("entities") {
            Some(Value::Object(entities)) => entities,
            _ => {
                let detail = root
                    .get("error")
                    .and_then(|err| err.get("info"))
                    .and_then(Value::as_str)
                    .unwrap_or("missing 'entities' key");
                return Err(HarvestError::Encoding(detail.to_string()));
            }
        };

        let mut bundle = EntityBundle::default();
        for (key, payload) in entities {
            let Ok(id) = key.parse::<EntityId>() else {
                tracing::debug!(key = %key, "ignoring unexpected entity key");
                continue;
            };
            let payload = match payload {
                Value::Null => None,
                Value::Object(ref fields) if fields.contains_key("missing") => None,
                other => Some(other),
            };
            bundle.entities.insert(id, payload);
        }
        Ok(bundle)
    }

    pub fn label(&self, id: &EntityId, language: &Language) -> Option<String> {
        self.entities
            .get(id)?
            .as_ref()?
            .get("labels")?
            .get(language.as_str())?
            .get("value")?
            .as_str()
            .map(str::to_string)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

pub trait QuerySource {
    fn run_query(&self, sparql: &str) -> Result<Table, HarvestError>;
}

pub trait EntitySource {
    /// `Ok(None)` means the batch could not be retrieved and should be retried in a later run.
    fn fetch_entities(
        &self,
        ids: &[EntityId],
        language: &Language,
        props: &str,
    ) -> Result<Option<EntityBundle>, HarvestError>;
}

pub trait LabelSource {
    fn fetch_label(&self, id: &EntityId, language: &Language) -> Option<String>;
}

impl<S: QuerySource + ?Sized> QuerySource for &S {
    fn run_query(&self, sparql: &str) -> Result<Table, HarvestError> {
        (**self).run_query(sparql)
    }
}

impl<S: EntitySource + ?Sized> EntitySource for &S {
    fn fetch_entities(
        &self,
        ids: &[EntityId],
        language: &Language,
        props: &str,
    ) -> Result<Option<EntityBundle>, HarvestError> {
        (**self).fetch_entities(ids, language, props)
    }
}

impl<S: LabelSource + ?Sized> LabelSource for &S {
    fn fetch_label(&self, id: &EntityId, language: &Language) -> Option<String> {
        (**self).fetch_label(id, language)
    }
}

#[derive(Deserialize)]
struct SparqlResponse {
    head: Option<SparqlHead>,
    results: Option<SparqlResults>,
}

#[derive(Deserialize)]
struct SparqlHead {
    vars: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct SparqlResults {
    bindings: Option<Vec<HashMap<String, SparqlValue>>>,
}

#[derive(Deserialize)]
struct SparqlValue {
    value: String,
}

#[derive(Clone)]
pub struct WikidataClient<T: Transport> {
    transport: T,
    sparql_url: String,
    api_url: String,
    max_retries: u32,
    retry_backoff: Duration,
}

impl WikidataClient<HttpTransport> {
    pub fn from_config(config: &Config) -> Result<Self, HarvestError> {
        Ok(Self::new(HttpTransport::from_config(config)?, config))
    }
}

impl<T: Transport> WikidataClient<T> {
    pub fn new(transport: T, config: &Config) -> Self {
        Self {
            transport,
            sparql_url: config.sparql_url.clone(),
            api_url: config.api_url.clone(),
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Requests `ids` in one `wbgetentities` call, retrying 429/503 up to `max_retries` attempts.
    ///
    /// Transport and decoding failures are logged and reported as `Ok(None)`; any other
    /// non-200 status is returned as [`HarvestError::UnexpectedStatus`].
    pub fn fetch_entities_with_retries(
        &self,
        ids: &[EntityId],
        language: &Language,
        props: &str,
        max_retries: u32,
    ) -> Result<Option<EntityBundle>, HarvestError> {
        if ids.is_empty() {
            return Ok(Some(EntityBundle::default()));
        }
        let joined = join_ids(ids);
        let params = [
            ("action", "wbgetentities"),
            ("ids", joined.as_str()),
            ("format", "json"),
            ("languages", language.as_str()),
            ("props", props),
        ];

        for attempt in 1..=max_retries {
            let response = match self.transport.get(&self.api_url, &params) {
                Ok(response) => response,
                Err(err) => {
                    tracing::error!(ids = %joined, error = %err, "entity request failed");
                    return Ok(None);
                }
            };

            match response.status {
                200 => {
                    let decoded = response.text().and_then(|text| {
                        serde_json::from_str::<Value>(text)
                            .map_err(|err| HarvestError::Encoding(err.to_string()))
                    });
                    return match decoded.and_then(EntityBundle::from_response) {
                        Ok(bundle) => Ok(Some(bundle)),
                        Err(err) => {
                            tracing::error!(ids = %joined, error = %err, "undecodable entity response");
                            Ok(None)
                        }
                    };
                }
                429 | 503 => {
                    tracing::warn!(
                        ids = %joined,
                        status = response.status,
                        attempt,
                        max_retries,
                        "entity request throttled"
                    );
                    if attempt < max_retries {
                        thread::sleep(self.retry_backoff);
                    }
                }
                status => {
                    let message = response
                        .text()
                        .map(|text| text.chars().take(200).collect::<String>())
                        .unwrap_or_else(|_| "entity request failed".to_string());
                    return Err(HarvestError::UnexpectedStatus { status, message });
                }
            }
        }

        tracing::warn!(ids = %joined, max_retries, "giving up on entity batch");
        Ok(None)
    }
}

impl<T: Transport> QuerySource for WikidataClient<T> {
    fn run_query(&self, sparql: &str) -> Result<Table, HarvestError> {
        tracing::debug!(query = %sparql, "running SPARQL query");
        let response = self
            .transport
            .get(&self.sparql_url, &[("format", "json"), ("query", sparql)])?;

        let parsed: SparqlResponse = match serde_json::from_slice(&response.body) {
            Ok(parsed) => parsed,
            Err(err) => {
                let body = String::from_utf8_lossy(&response.body);
                tracing::error!(status = response.status, body = %body, "invalid SPARQL response");
                return Err(HarvestError::QueryProtocol(format!(
                    "status {}: {err}",
                    response.status
                )));
            }
        };

        let bindings = parsed
            .results
            .and_then(|results| results.bindings)
            .ok_or(HarvestError::QueryEmpty)?;
        let columns = parsed
            .head
            .and_then(|head| head.vars)
            .ok_or_else(|| HarvestError::QueryProtocol("missing head.vars".to_string()))?;

        let mut table = Table::new(columns);
        for mut binding in bindings {
            let row = table
                .columns
                .iter()
                .map(|column| binding.remove(column).map(|cell| cell.value))
                .collect();
            table.rows.push(row);
        }
        tracing::debug!(rows = table.len(), "SPARQL query returned");
        Ok(table)
    }
}

impl<T: Transport> EntitySource for WikidataClient<T> {
    fn fetch_entities(
        &self,
        ids: &[EntityId],
        language: &Language,
        props: &str,
    ) -> Result<Option<EntityBundle>, HarvestError> {
        self.fetch_entities_with_retries(ids, language, props, self.max_retries)
    }
}

impl<T: Transport> LabelSource for WikidataClient<T> {
    fn fetch_label(&self, id: &EntityId, language: &Language) -> Option<String> {
        match self.fetch_entities(std::slice::from_ref(id), language, PROPS_LABELS) {
            Ok(Some(bundle)) => bundle.label(id, language),
            Ok(None) => None,
            Err(err) => {
                tracing::error!(id = %id, error = %err, "label lookup failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn bundle_marks_missing_entities_as_empty() {
        let bundle = EntityBundle::from_response(json!({
            "entities": {
                "Q1": { "id": "Q1", "labels": { "en": { "language": "en", "value": "universe" } } },
                "Q999999999": { "id": "Q999999999", "missing": "" },
                "-1": { "missing": "" }
            }
        }))
        .unwrap();

        let q1: EntityId = "Q1".parse().unwrap();
        let missing: EntityId = "Q999999999".parse().unwrap();
        assert_eq!(bundle.len(), 2);
        assert_eq!(bundle.entities[&missing], None);
        assert_eq!(
            bundle.label(&q1, &Language::default()).as_deref(),
            Some("universe")
        );
    }

    #[test]
    fn bundle_surfaces_api_error() {
        let err = EntityBundle::from_response(json!({
            "error": { "code": "no-such-entity", "info": "Could not find an entity" }
        }))
        .unwrap_err();
        assert!(err.to_string().contains("Could not find"));
    }

    #[test]
    fn table_push_and_map_columns() {
        let mut table = Table::new(vec!["item".to_string()]);
        table.rows.push(vec![Some("http://www.wikidata.org/entity/Q1".to_string())]);
        table.rows.push(vec![None]);
        table.map_column("item", |value| value.rsplit('/').next().map(str::to_string));
        table.push_column("flag", |row| row[0].as_ref().map(|_| "y".to_string()));

        assert_eq!(table.get(0, "item"), Some("Q1"));
        assert_eq!(table.get(1, "item"), None);
        assert_eq!(table.column_values("flag"), vec![Some("y"), None]);
    }
}
