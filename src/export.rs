use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::Compression as GzLevel;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use rusqlite::Connection;
use rusqlite::types::Value as SqlValue;

use crate::error::HarvestError;
use crate::geometry::parse_wkt_point;
use crate::query::Table;

/// Destination for tables written in pieces: the first write replaces, later writes append.
pub trait TableSink {
    fn write_table(&mut self, table: &Table, append: bool) -> Result<(), HarvestError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

impl Compression {
    pub fn infer(path: &Utf8Path) -> Self {
        match path.extension() {
            Some("gz") => Compression::Gzip,
            _ => Compression::None,
        }
    }
}

/// CSV file; a header row is written only when the file is replaced.
#[derive(Debug, Clone)]
pub struct CsvSink {
    path: Utf8PathBuf,
    compression: Compression,
}

impl CsvSink {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        let path = path.into();
        let compression = Compression::infer(&path);
        Self { path, compression }
    }
}

impl TableSink for CsvSink {
    fn write_table(&mut self, table: &Table, append: bool) -> Result<(), HarvestError> {
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_str().is_empty()) {
            std::fs::create_dir_all(parent.as_std_path())
                .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(self.path.as_std_path())
            .map_err(|err| HarvestError::Filesystem(format!("open {}: {err}", self.path)))?;

        match self.compression {
            Compression::None => {
                let mut file = write_csv(file, table, !append)?;
                file.flush()
                    .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
            }
            Compression::Gzip => {
                // Appends become extra gzip members, which readers concatenate.
                let encoder = write_csv(GzEncoder::new(file, GzLevel::default()), table, !append)?;
                encoder
                    .finish()
                    .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
            }
        }
        tracing::debug!(path = %self.path, rows = table.len(), append, "csv chunk written");
        Ok(())
    }
}

fn write_csv<W: Write>(writer: W, table: &Table, header: bool) -> Result<W, HarvestError> {
    let mut csv_writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(writer);
    if header {
        csv_writer.write_record(&table.columns)?;
    }
    for row in &table.rows {
        csv_writer.write_record(row.iter().map(|cell| cell.as_deref().unwrap_or("")))?;
    }
    csv_writer
        .into_inner()
        .map_err(|err| HarvestError::Csv(err.to_string()))
}

/// SQLite table with TEXT columns; a WKT point column also gets `<column>_lon`/`<column>_lat`.
pub struct SqliteSink {
    conn: Connection,
    table_name: String,
    geometry: Option<GeometryColumn>,
}

#[derive(Debug, Clone)]
struct GeometryColumn {
    name: String,
    srid: u32,
}

impl SqliteSink {
    pub fn open(path: &Utf8Path, table_name: &str) -> Result<Self, HarvestError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_str().is_empty()) {
            std::fs::create_dir_all(parent.as_std_path())
                .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        }
        let conn = Connection::open(path.as_std_path())?;
        Ok(Self::from_connection(conn, table_name))
    }

    pub fn from_connection(conn: Connection, table_name: &str) -> Self {
        Self {
            conn,
            table_name: table_name.to_string(),
            geometry: None,
        }
    }

    pub fn with_geometry(mut self, column: &str, srid: u32) -> Self {
        self.geometry = Some(GeometryColumn {
            name: column.to_string(),
            srid,
        });
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Table columns followed by the generated coordinate columns, if any.
    fn column_names(&self, table: &Table) -> (Vec<String>, Vec<String>) {
        let coordinates = match self.geometry_in(table) {
            Some(geometry) => vec![
                format!("{}_lon", geometry.name),
                format!("{}_lat", geometry.name),
            ],
            None => Vec::new(),
        };
        (table.columns.clone(), coordinates)
    }

    fn geometry_in(&self, table: &Table) -> Option<&GeometryColumn> {
        self.geometry
            .as_ref()
            .filter(|geometry| table.column_index(&geometry.name).is_some())
    }

    fn create_table(&self, table: &Table) -> Result<(), HarvestError> {
        let name = quote_ident(&self.table_name);
        let (text_columns, coordinates) = self.column_names(table);
        let columns = text_columns
            .iter()
            .map(|column| format!("{} TEXT", quote_ident(column)))
            .chain(
                coordinates
                    .iter()
                    .map(|column| format!("{} REAL", quote_ident(column))),
            )
            .collect::<Vec<_>>()
            .join(", ");
        self.conn.execute_batch(&format!(
            "DROP TABLE IF EXISTS {name};\nCREATE TABLE {name} ({columns});"
        ))?;

        if let Some(geometry) = self.geometry_in(table) {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS geometry_columns (\
                 f_table_name TEXT NOT NULL, f_geometry_column TEXT NOT NULL, \
                 geometry_type TEXT NOT NULL, srid INTEGER NOT NULL, \
                 PRIMARY KEY (f_table_name, f_geometry_column));",
            )?;
            self.conn.execute(
                "INSERT OR REPLACE INTO geometry_columns VALUES (?1, ?2, 'POINT', ?3)",
                rusqlite::params![self.table_name, geometry.name, geometry.srid],
            )?;
        }
        Ok(())
    }
}

impl TableSink for SqliteSink {
    fn write_table(&mut self, table: &Table, append: bool) -> Result<(), HarvestError> {
        if !append {
            self.create_table(table)?;
        }
        let geometry_index = self
            .geometry_in(table)
            .and_then(|geometry| table.column_index(&geometry.name));
        let (mut columns, coordinates) = self.column_names(table);
        columns.extend(coordinates);
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(&self.table_name),
            columns
                .iter()
                .map(|column| quote_ident(column))
                .collect::<Vec<_>>()
                .join(", "),
            (1..=columns.len())
                .map(|index| format!("?{index}"))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let tx = self.conn.transaction()?;
        {
            let mut statement = tx.prepare(&sql)?;
            for row in &table.rows {
                let mut values: Vec<SqlValue> = row
                    .iter()
                    .map(|cell| match cell {
                        Some(value) => SqlValue::Text(value.clone()),
                        None => SqlValue::Null,
                    })
                    .collect();
                if let Some(index) = geometry_index {
                    let point = row[index].as_deref().and_then(parse_wkt_point);
                    if point.is_none() && row[index].is_some() {
                        tracing::warn!(value = ?row[index], "geometry is not a WKT point");
                    }
                    let (lon, lat) = match point {
                        Some((lon, lat)) => (SqlValue::Real(lon), SqlValue::Real(lat)),
                        None => (SqlValue::Null, SqlValue::Null),
                    };
                    values.push(lon);
                    values.push(lat);
                }
                statement.execute(rusqlite::params_from_iter(values))?;
            }
        }
        tx.commit()?;
        tracing::debug!(table = %self.table_name, rows = table.len(), append, "sqlite chunk written");
        Ok(())
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn open_csv_reader(path: &Utf8Path) -> Result<csv::Reader<Box<dyn Read>>, HarvestError> {
    let file = File::open(path.as_std_path())
        .map_err(|err| HarvestError::Filesystem(format!("open {path}: {err}")))?;
    let reader: Box<dyn Read> = match Compression::infer(path) {
        Compression::Gzip => Box::new(MultiGzDecoder::new(BufReader::new(file))),
        Compression::None => Box::new(BufReader::new(file)),
    };
    Ok(csv::ReaderBuilder::new().has_headers(true).from_reader(reader))
}

/// Streams a CSV file (gzip if it ends in `.gz`) into `sink` in chunks of `chunk_size` rows.
///
/// Empty cells become nulls. Returns the number of rows loaded.
pub fn load_csv(
    path: &Utf8Path,
    sink: &mut dyn TableSink,
    chunk_size: usize,
) -> Result<usize, HarvestError> {
    let chunk_size = chunk_size.max(1);
    let mut reader = open_csv_reader(path)?;
    let columns = reader
        .headers()?
        .iter()
        .map(str::to_string)
        .collect::<Vec<_>>();

    let mut chunk = Table::new(columns.clone());
    let mut chunks_written = 0usize;
    let mut total = 0usize;
    for record in reader.records() {
        let record = record?;
        chunk.rows.push(
            record
                .iter()
                .map(|value| (!value.is_empty()).then(|| value.to_string()))
                .collect(),
        );
        if chunk.len() == chunk_size {
            tracing::debug!(chunk = chunks_written + 1, "loading chunk");
            sink.write_table(&chunk, chunks_written > 0)?;
            chunks_written += 1;
            total += chunk.len();
            chunk = Table::new(columns.clone());
        }
    }
    if !chunk.is_empty() || chunks_written == 0 {
        sink.write_table(&chunk, chunks_written > 0)?;
        total += chunk.len();
    }
    Ok(total)
}

/// Loads a CSV export into a SQLite table, replacing any existing table of that name.
pub fn csv_to_sqlite(
    csv_path: &Utf8Path,
    db_path: &Utf8Path,
    table_name: &str,
    geometry_column: Option<&str>,
    chunk_size: usize,
) -> Result<usize, HarvestError> {
    let mut sink = SqliteSink::open(db_path, table_name)?;
    if let Some(column) = geometry_column {
        sink = sink.with_geometry(column, 4326);
    }
    let rows = load_csv(csv_path, &mut sink, chunk_size)?;
    tracing::info!(table = %table_name, rows, db = %db_path, "csv imported");
    Ok(rows)
}
