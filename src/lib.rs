pub mod collect;
pub mod config;
pub mod domain;
pub mod error;
pub mod export;
pub mod geometry;
pub mod labels;
pub mod output;
pub mod query;
pub mod sparql;
pub mod store;
pub mod transport;
