use std::collections::{HashMap, VecDeque};
use std::path::Path;

use anyhow::{Context, Result, bail};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, params};
use tracing::info;

use super::{RawRecord, RawValue, RecordFailure, RecordLocation, RecordResult, RecordSource};
use crate::error::RecordError;
use crate::model::RecordKind;
use crate::util::quote_identifier;

const PAGE_SIZE: i64 = 2_000;

pub(super) fn open(path: &Path, table: Option<&str>) -> Result<RecordSource> {
    if !path.is_file() {
        bail!("legacy database not found: {}", path.display());
    }
    let connection = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("failed to open legacy database: {}", path.display()))?;

    let table = match table {
        Some(name) => {
            let tables = list_tables(&connection)?;
            if !tables.iter().any(|t| t == name) {
                bail!(
                    "table `{name}` not found in {} (available: {})",
                    path.display(),
                    tables.join(", ")
                );
            }
            name.to_string()
        }
        None => detect_voter_table(&connection)?,
    };

    let total: i64 = connection
        .query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_identifier(&table)),
            [],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to count rows in legacy table {table}"))?;
    info!(table = %table, rows = total, "legacy source table selected");

    let label = format!(
        "{}:{table}",
        path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    );
    let rows = LegacyRows::new(connection, label.clone(), table)?;

    Ok(RecordSource {
        label,
        total: Some(total.max(0) as u64),
        sha256: None,
        records: Box::new(rows),
    })
}

fn list_tables(connection: &Connection) -> Result<Vec<String>> {
    let mut statement = connection.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY rowid",
    )?;
    let rows = statement.query_map([], |row| row.get::<_, String>(0))?;
    let mut tables = Vec::new();
    for row in rows {
        tables.push(row?);
    }
    Ok(tables)
}

/// Picks the first table whose name mentions voters, else the first table.
pub(super) fn detect_voter_table(connection: &Connection) -> Result<String> {
    let tables = list_tables(connection)?;
    let preferred = tables
        .iter()
        .find(|name| name.to_lowercase().contains("voter"))
        .or_else(|| tables.first());
    match preferred {
        Some(name) => Ok(name.clone()),
        None => bail!("legacy database has no tables"),
    }
}

/// Streams a table in rowid order, one page at a time.
pub(super) struct LegacyRows {
    connection: Connection,
    label: String,
    select_sql: String,
    last_rowid: i64,
    buffer: VecDeque<RecordResult>,
    exhausted: bool,
}

impl LegacyRows {
    pub(super) fn new(connection: Connection, label: String, table: String) -> Result<Self> {
        let select_sql = format!(
            "SELECT rowid, * FROM {} WHERE rowid > ?1 ORDER BY rowid LIMIT ?2",
            quote_identifier(&table)
        );
        connection
            .prepare(&select_sql)
            .with_context(|| format!("legacy table {table} cannot be paged by rowid"))?;

        Ok(Self {
            connection,
            label,
            select_sql,
            last_rowid: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        })
    }

    fn fetch_page(&mut self) -> rusqlite::Result<()> {
        let mut statement = self.connection.prepare_cached(&self.select_sql)?;
        let columns: Vec<String> = statement
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let mut rows = statement.query(params![self.last_rowid, PAGE_SIZE])?;
        let mut fetched = 0;

        while let Some(row) = rows.next()? {
            fetched += 1;
            let rowid: i64 = row.get(0)?;
            self.last_rowid = rowid;

            let mut fields = HashMap::new();
            for (index, column) in columns.iter().enumerate().skip(1) {
                if let Some(value) = sql_value(row.get_ref(index)?) {
                    fields.insert(column.clone(), value);
                }
            }
            self.buffer.push_back(Ok(RawRecord {
                location: RecordLocation::new(&self.label, rowid as u64),
                kind: RecordKind::Voter,
                source_pk: None,
                fields,
            }));
        }

        if fetched < PAGE_SIZE {
            self.exhausted = true;
        }
        Ok(())
    }
}

impl Iterator for LegacyRows {
    type Item = RecordResult;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(err) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(RecordFailure {
                    location: RecordLocation::new(&self.label, self.last_rowid as u64),
                    error: RecordError::malformed(format!("legacy read failed: {err}")),
                }));
            }
        }
        self.buffer.pop_front()
    }
}

fn sql_value(value: ValueRef<'_>) -> Option<RawValue> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(int) => Some(RawValue::Integer(int)),
        ValueRef::Real(real) => Some(RawValue::Float(real)),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes).trim().to_string();
            (!text.is_empty()).then_some(RawValue::Text(text))
        }
        ValueRef::Blob(_) => None,
    }
}
