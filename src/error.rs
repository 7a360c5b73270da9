use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum HarvestError {
    #[error("invalid entity id: {0}")]
    InvalidEntityId(String),

    #[error("invalid language tag: {0}")]
    InvalidLanguage(String),

    #[error("invalid bounding box: {0}")]
    InvalidBoundingBox(String),

    #[error("invalid identifier source: {0}")]
    InvalidIdentifierSource(String),

    #[error("SPARQL endpoint returned an undecodable response: {0}")]
    #[diagnostic(help("check the query syntax; the endpoint answers malformed queries with plain text"))]
    QueryProtocol(String),

    #[error("SPARQL response has no result bindings")]
    QueryEmpty,

    #[error("knowledge base returned status {status}: {message}")]
    UnexpectedStatus { status: u16, message: String },

    #[error("knowledge base request failed: {0}")]
    Http(String),

    #[error("failed to decode response body: {0}")]
    Encoding(String),

    #[error("config file not found: {0}")]
    MissingConfig(PathBuf),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("label cache file is malformed: {0}")]
    LabelCacheFormat(String),

    #[error("label cache holds '{found}' labels but '{expected}' was requested")]
    #[diagnostic(help("use a separate label cache file per language"))]
    LabelLanguageMismatch { expected: String, found: String },

    #[error("csv error: {0}")]
    Csv(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<csv::Error> for HarvestError {
    fn from(err: csv::Error) -> Self {
        HarvestError::Csv(err.to_string())
    }
}

impl From<rusqlite::Error> for HarvestError {
    fn from(err: rusqlite::Error) -> Self {
        HarvestError::Database(err.to_string())
    }
}
