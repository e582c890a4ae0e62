use std::collections::HashSet;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use crate::cli::EmptyValuePolicy;
use crate::model::VoterRecord;

/// Returns the subset of `voter_numbers` already present in the store, using a
/// single `IN (...)` lookup.
pub fn existing_voter_numbers(
    connection: &Connection,
    voter_numbers: &[&str],
) -> Result<HashSet<String>> {
    if voter_numbers.is_empty() {
        return Ok(HashSet::new());
    }

    let placeholders = vec!["?"; voter_numbers.len()].join(", ");
    let sql = format!("SELECT voter_number FROM voters WHERE voter_number IN ({placeholders})");
    let mut statement = connection
        .prepare(&sql)
        .context("failed to prepare voter existence lookup")?;
    let rows = statement.query_map(params_from_iter(voter_numbers.iter()), |row| {
        row.get::<_, String>(0)
    })?;

    let mut existing = HashSet::with_capacity(voter_numbers.len());
    for row in rows {
        existing.insert(row?);
    }
    Ok(existing)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The source primary key already belongs to another row, so the voter was
    /// stored under an id assigned by the store.
    ReassignedId,
    /// The voter number already exists.
    Absorbed,
}

/// Inserts a new voter. Only a voter-number conflict is absorbed. A source
/// primary key held by a different row is dropped in favour of a fresh id.
pub fn insert_voter(
    connection: &Connection,
    record: &VoterRecord,
    now: &str,
) -> Result<InsertOutcome> {
    let id = match record.source_pk {
        Some(pk) if voter_id_exists(connection, pk)? => None,
        other => other,
    };
    let reassigned = id.is_none() && record.source_pk.is_some();

    let mut statement = connection.prepare_cached(
        "INSERT INTO voters(
           id, voter_number, full_name, mother_name, date_of_birth, phone,
           family_number, governorate, status, classification,
           voting_center_number, voting_center_name,
           registration_center_number, registration_center_name, station_number,
           created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16)
         ON CONFLICT(voter_number) DO NOTHING",
    )?;

    let inserted = statement
        .execute(params![
            id,
            record.voter_number,
            stored(&record.full_name),
            stored(&record.mother_name),
            stored(&record.date_of_birth),
            stored(&record.phone),
            stored(&record.family_number),
            stored(&record.governorate),
            stored(&record.status),
            stored(&record.classification).unwrap_or("unknown"),
            stored(&record.voting_center_number),
            stored(&record.voting_center_name),
            stored(&record.registration_center_number),
            stored(&record.registration_center_name),
            stored(&record.station_number),
            now,
        ])
        .with_context(|| format!("failed to insert voter {}", record.voter_number))?;

    Ok(match (inserted > 0, reassigned) {
        (false, _) => InsertOutcome::Absorbed,
        (true, true) => InsertOutcome::ReassignedId,
        (true, false) => InsertOutcome::Inserted,
    })
}

/// Writes the fields the incoming record carries onto the existing row with
/// the same voter number. Absent fields are never touched.
pub fn update_voter(
    connection: &Connection,
    record: &VoterRecord,
    empty_values: EmptyValuePolicy,
    now: &str,
) -> Result<usize> {
    let mut assignments = Vec::new();
    let mut values: Vec<Option<&str>> = Vec::new();

    for (column, value) in record.column_values() {
        if column == "voter_number" {
            continue;
        }
        let Some(value) = value else {
            continue;
        };
        if value.trim().is_empty() {
            match empty_values {
                EmptyValuePolicy::Preserve => continue,
                EmptyValuePolicy::Overwrite if column == "classification" => {
                    values.push(Some("unknown"));
                }
                EmptyValuePolicy::Overwrite => values.push(None),
            }
        } else {
            values.push(Some(value));
        }
        assignments.push(format!("{column} = ?{}", values.len()));
    }

    values.push(Some(now));
    assignments.push(format!("updated_at = ?{}", values.len()));
    values.push(Some(record.voter_number.as_str()));
    let sql = format!(
        "UPDATE voters SET {} WHERE voter_number = ?{}",
        assignments.join(", "),
        values.len()
    );

    let updated = connection
        .execute(&sql, params_from_iter(values.iter()))
        .with_context(|| format!("failed to update voter {}", record.voter_number))?;
    Ok(updated)
}

pub fn voter_id_exists(connection: &Connection, id: i64) -> Result<bool> {
    let found = connection
        .query_row("SELECT 1 FROM voters WHERE id = ?1", [id], |_| Ok(()))
        .optional()
        .with_context(|| format!("failed to look up voter id {id}"))?;
    Ok(found.is_some())
}

fn stored(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}
