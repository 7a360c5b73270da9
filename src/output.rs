use std::io::{self, Write};

use serde::Serialize;

use crate::collect::{BboxReport, CollectReport};
use crate::query::Table;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_collect(result: &CollectReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_bbox(result: &BboxReport) -> io::Result<()> {
        Self::print_json(result)
    }

    /// Rows as objects keyed by column name, nulls preserved.
    pub fn print_table(table: &Table) -> io::Result<()> {
        let rows = (0..table.len())
            .filter_map(|row| table.row_map(row))
            .collect::<Vec<_>>();
        Self::print_json(&rows)
    }

    pub fn print_json<T: Serialize + ?Sized>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
