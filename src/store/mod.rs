use std::path::Path;

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OpenFlags};

use crate::util::{ensure_directory, now_utc_string};

pub mod hierarchy;
pub mod voters;

pub const DB_SCHEMA_VERSION: &str = "1.1.0";

/// Opens (creating if needed) the destination store and brings its schema up
/// to date.
pub fn open_store(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        ensure_directory(parent)?;
    }

    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open database: {}", db_path.display()))?;
    configure_connection(&connection)?;
    ensure_schema(&connection)?;
    Ok(connection)
}

pub fn open_store_read_only(db_path: &Path) -> Result<Connection> {
    if !db_path.exists() {
        bail!("database not found: {}", db_path.display());
    }

    Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("failed to open database read-only: {}", db_path.display()))
}

fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    Ok(())
}

pub fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
        CREATE TABLE IF NOT EXISTS metadata (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS registration_centers (
          id INTEGER PRIMARY KEY,
          center_number TEXT NOT NULL UNIQUE,
          name TEXT NOT NULL,
          governorate TEXT,
          created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS polling_centers (
          id INTEGER PRIMARY KEY,
          center_number TEXT NOT NULL UNIQUE,
          name TEXT NOT NULL,
          voting_type TEXT NOT NULL DEFAULT 'general',
          governorate TEXT,
          address TEXT,
          location TEXT,
          registration_center_number TEXT,
          registration_center_name TEXT,
          registration_center_id INTEGER,
          created_at TEXT NOT NULL,
          updated_at TEXT NOT NULL,
          FOREIGN KEY(registration_center_id) REFERENCES registration_centers(id)
        );

        CREATE TABLE IF NOT EXISTS polling_stations (
          id INTEGER PRIMARY KEY,
          center_id INTEGER NOT NULL,
          station_number INTEGER NOT NULL,
          full_number TEXT NOT NULL UNIQUE,
          created_at TEXT NOT NULL,
          UNIQUE(center_id, station_number),
          FOREIGN KEY(center_id) REFERENCES polling_centers(id)
        );

        CREATE TABLE IF NOT EXISTS voters (
          id INTEGER PRIMARY KEY,
          voter_number TEXT NOT NULL UNIQUE,
          full_name TEXT,
          mother_name TEXT,
          date_of_birth TEXT,
          phone TEXT,
          family_number TEXT,
          governorate TEXT,
          status TEXT,
          classification TEXT NOT NULL DEFAULT 'unknown',
          voting_center_number TEXT,
          voting_center_name TEXT,
          registration_center_number TEXT,
          registration_center_name TEXT,
          station_number TEXT,
          polling_center_id INTEGER,
          polling_station_id INTEGER,
          registration_center_id INTEGER,
          created_at TEXT NOT NULL,
          updated_at TEXT NOT NULL,
          FOREIGN KEY(polling_center_id) REFERENCES polling_centers(id),
          FOREIGN KEY(polling_station_id) REFERENCES polling_stations(id),
          FOREIGN KEY(registration_center_id) REFERENCES registration_centers(id)
        );
        ",
        )
        .context("failed to create destination tables")?;

    ensure_column_exists(
        connection,
        "polling_centers",
        "station_count INTEGER NOT NULL DEFAULT 1",
    )?;
    ensure_column_exists(
        connection,
        "polling_centers",
        "is_placeholder INTEGER NOT NULL DEFAULT 0",
    )?;

    connection.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_voters_voting_center ON voters(voting_center_number);
        CREATE INDEX IF NOT EXISTS idx_voters_registration_center ON voters(registration_center_number);
        CREATE INDEX IF NOT EXISTS idx_polling_centers_registration ON polling_centers(registration_center_number);
        CREATE INDEX IF NOT EXISTS idx_polling_stations_center ON polling_stations(center_id);
        ",
    )?;

    let now = now_utc_string();
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [DB_SCHEMA_VERSION],
    )?;
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_updated_at', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [now],
    )?;

    Ok(())
}

fn ensure_column_exists(
    connection: &Connection,
    table_name: &str,
    column_definition: &str,
) -> Result<()> {
    let Some(column_name) = column_definition.split_whitespace().next() else {
        bail!("invalid column definition: {column_definition}");
    };

    let pragma_sql = format!("PRAGMA table_info({table_name})");
    let mut statement = connection
        .prepare(&pragma_sql)
        .with_context(|| format!("failed to inspect schema for table {table_name}"))?;

    let mut rows = statement.query([])?;
    while let Some(row) = rows.next()? {
        let existing_name: String = row.get(1)?;
        if existing_name == column_name {
            return Ok(());
        }
    }

    let alter_sql = format!("ALTER TABLE {table_name} ADD COLUMN {column_definition}");
    connection
        .execute(&alter_sql, [])
        .with_context(|| format!("failed to add column {column_name} on {table_name}"))?;

    Ok(())
}

pub fn count_rows(connection: &Connection, sql: &str) -> Result<i64> {
    let count = connection
        .query_row(sql, [], |row| row.get(0))
        .with_context(|| format!("failed to count rows: {sql}"))?;
    Ok(count)
}

#[cfg(test)]
pub(crate) fn open_test_store() -> Connection {
    let connection = Connection::open_in_memory().expect("in-memory DB should open");
    ensure_schema(&connection).expect("schema should initialize");
    connection
}
