use std::collections::HashMap;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use crate::model::PollingCenterRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CenterEntry {
    pub id: i64,
    pub station_count: u32,
}

#[derive(Debug, Clone)]
pub struct PlaceholderCenter<'a> {
    pub center_number: &'a str,
    pub name: &'a str,
    pub governorate: Option<&'a str>,
    pub registration_center_number: Option<&'a str>,
    pub registration_center_name: Option<&'a str>,
    pub registration_center_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct CenterRegistrationRef {
    pub center_id: i64,
    pub registration_center_number: String,
    pub registration_center_name: Option<String>,
    pub governorate: Option<String>,
    pub registration_center_id: Option<i64>,
}

pub fn load_registration_centers(connection: &Connection) -> Result<HashMap<String, i64>> {
    let mut statement = connection.prepare("SELECT center_number, id FROM registration_centers")?;
    let rows = statement.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get(1)?)))?;
    let mut centers = HashMap::new();
    for row in rows {
        let (number, id) = row?;
        centers.insert(number, id);
    }
    Ok(centers)
}

pub fn load_polling_centers(connection: &Connection) -> Result<HashMap<String, CenterEntry>> {
    let mut statement =
        connection.prepare("SELECT center_number, id, station_count FROM polling_centers")?;
    let rows = statement.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            CenterEntry {
                id: row.get(1)?,
                station_count: row.get::<_, i64>(2)?.clamp(0, i64::from(u32::MAX)) as u32,
            },
        ))
    })?;
    let mut centers = HashMap::new();
    for row in rows {
        let (number, entry) = row?;
        centers.insert(number, entry);
    }
    Ok(centers)
}

pub fn load_stations(connection: &Connection) -> Result<HashMap<(i64, u32), i64>> {
    let mut statement =
        connection.prepare("SELECT center_id, station_number, id FROM polling_stations")?;
    let rows = statement.query_map([], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, u32>(1)?, row.get::<_, i64>(2)?))
    })?;
    let mut stations = HashMap::new();
    for row in rows {
        let (center_id, station_number, id) = row?;
        stations.insert((center_id, station_number), id);
    }
    Ok(stations)
}

/// Returns the registration center id for `center_number`, creating the row
/// when absent. The flag reports whether a row was created.
pub fn get_or_create_registration_center(
    connection: &Connection,
    center_number: &str,
    name: Option<&str>,
    governorate: Option<&str>,
    now: &str,
) -> Result<(i64, bool)> {
    let placeholder = format!("Registration center {center_number}");
    let created = connection
        .execute(
            "INSERT OR IGNORE INTO registration_centers(center_number, name, governorate, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![center_number, name.unwrap_or(placeholder.as_str()), governorate, now],
        )
        .with_context(|| format!("failed to create registration center {center_number}"))?;
    let id = connection.query_row(
        "SELECT id FROM registration_centers WHERE center_number = ?1",
        [center_number],
        |row| row.get(0),
    )?;
    Ok((id, created > 0))
}

/// Inserts or refreshes a polling center from an authoritative center list.
/// Placeholder rows created by the linker are promoted to real rows.
pub fn upsert_polling_center(
    connection: &Connection,
    record: &PollingCenterRecord,
    voting_type: &str,
    registration_center_id: Option<i64>,
    now: &str,
) -> Result<(i64, bool)> {
    let existing: Option<i64> = connection
        .query_row(
            "SELECT id FROM polling_centers WHERE center_number = ?1",
            [&record.center_number],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        Some(id) => {
            connection
                .execute(
                    "UPDATE polling_centers SET
                       name = ?1, voting_type = ?2, governorate = ?3, address = ?4, location = ?5,
                       registration_center_number = ?6, registration_center_name = ?7,
                       registration_center_id = COALESCE(?8, registration_center_id),
                       station_count = ?9, is_placeholder = 0, updated_at = ?10
                     WHERE id = ?11",
                    params![
                        record.name,
                        voting_type,
                        record.governorate,
                        record.address,
                        record.location,
                        record.registration_center_number,
                        record.registration_center_name,
                        registration_center_id,
                        record.station_count,
                        now,
                        id,
                    ],
                )
                .with_context(|| format!("failed to update polling center {}", record.center_number))?;
            Ok((id, false))
        }
        None => {
            connection
                .execute(
                    "INSERT INTO polling_centers(
                       center_number, name, voting_type, governorate, address, location,
                       registration_center_number, registration_center_name,
                       registration_center_id, station_count, is_placeholder,
                       created_at, updated_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?11)",
                    params![
                        record.center_number,
                        record.name,
                        voting_type,
                        record.governorate,
                        record.address,
                        record.location,
                        record.registration_center_number,
                        record.registration_center_name,
                        registration_center_id,
                        record.station_count,
                        now,
                    ],
                )
                .with_context(|| format!("failed to insert polling center {}", record.center_number))?;
            Ok((connection.last_insert_rowid(), true))
        }
    }
}

/// Returns the center with `center_number`, creating a placeholder when absent.
/// A row inserted by another writer since the cache loaded is reused as is.
pub fn get_or_create_placeholder_center(
    connection: &Connection,
    center: &PlaceholderCenter<'_>,
    now: &str,
) -> Result<(CenterEntry, bool)> {
    let created = connection
        .execute(
            "INSERT OR IGNORE INTO polling_centers(
               center_number, name, voting_type, governorate,
               registration_center_number, registration_center_name, registration_center_id,
               station_count, is_placeholder, created_at, updated_at
             ) VALUES (?1, ?2, 'general', ?3, ?4, ?5, ?6, 0, 1, ?7, ?7)",
            params![
                center.center_number,
                center.name,
                center.governorate,
                center.registration_center_number,
                center.registration_center_name,
                center.registration_center_id,
                now,
            ],
        )
        .with_context(|| format!("failed to create placeholder center {}", center.center_number))?;
    let entry = connection.query_row(
        "SELECT id, station_count FROM polling_centers WHERE center_number = ?1",
        [center.center_number],
        |row| {
            Ok(CenterEntry {
                id: row.get(0)?,
                station_count: row.get::<_, i64>(1)?.clamp(0, i64::from(u32::MAX)) as u32,
            })
        },
    )?;
    Ok((entry, created > 0))
}

/// Returns the station id for `(center_id, station_number)`, creating it when
/// absent.
pub fn get_or_create_station(
    connection: &Connection,
    center_id: i64,
    center_number: &str,
    station_number: u32,
    now: &str,
) -> Result<(i64, bool)> {
    let created = connection
        .execute(
            "INSERT OR IGNORE INTO polling_stations(center_id, station_number, full_number, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                center_id,
                station_number,
                format!("{center_number}-{station_number}"),
                now
            ],
        )
        .with_context(|| format!("failed to create station {center_number}-{station_number}"))?;
    let id = connection.query_row(
        "SELECT id FROM polling_stations WHERE center_id = ?1 AND station_number = ?2",
        params![center_id, station_number],
        |row| row.get(0),
    )?;
    Ok((id, created > 0))
}

pub fn centers_with_registration_numbers(
    connection: &Connection,
) -> Result<Vec<CenterRegistrationRef>> {
    let mut statement = connection.prepare(
        "SELECT id, registration_center_number, registration_center_name, governorate,
                registration_center_id
         FROM polling_centers
         WHERE COALESCE(TRIM(registration_center_number), '') <> ''
         ORDER BY id",
    )?;
    let rows = statement.query_map([], |row| {
        Ok(CenterRegistrationRef {
            center_id: row.get(0)?,
            registration_center_number: row.get::<_, String>(1)?.trim().to_string(),
            registration_center_name: row.get(2)?,
            governorate: row.get(3)?,
            registration_center_id: row.get(4)?,
        })
    })?;

    let mut centers = Vec::new();
    for row in rows {
        centers.push(row?);
    }
    Ok(centers)
}

pub fn set_center_registration(
    connection: &Connection,
    center_id: i64,
    registration_center_id: i64,
) -> Result<()> {
    connection
        .execute(
            "UPDATE polling_centers SET registration_center_id = ?1 WHERE id = ?2",
            params![registration_center_id, center_id],
        )
        .with_context(|| format!("failed to link polling center id {center_id}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_test_store;

    #[test]
    fn registration_center_is_created_once_with_placeholder_name() {
        let connection = open_test_store();
        let (first_id, created) =
            get_or_create_registration_center(&connection, "12", None, None, "t").expect("create");
        let (second_id, created_again) =
            get_or_create_registration_center(&connection, "12", Some("Other"), None, "t")
                .expect("lookup");

        assert!(created);
        assert!(!created_again);
        assert_eq!(first_id, second_id);
        let name: String = connection
            .query_row("SELECT name FROM registration_centers", [], |row| row.get(0))
            .expect("name should read");
        assert_eq!(name, "Registration center 12");
    }

    #[test]
    fn placeholder_reuses_a_center_inserted_after_the_cache_loaded() {
        let connection = open_test_store();
        let record = PollingCenterRecord {
            center_number: "3002".to_string(),
            name: "Real Center".to_string(),
            station_count: 5,
            ..PollingCenterRecord::default()
        };
        let (real_id, _) =
            upsert_polling_center(&connection, &record, "general", None, "t").expect("upsert");

        let (entry, created) = get_or_create_placeholder_center(
            &connection,
            &PlaceholderCenter {
                center_number: "3002",
                name: "From voter",
                governorate: None,
                registration_center_number: None,
                registration_center_name: None,
                registration_center_id: None,
            },
            "t2",
        )
        .expect("existing center should be reused");

        assert!(!created);
        assert_eq!(entry, CenterEntry { id: real_id, station_count: 5 });
        let name: String = connection
            .query_row("SELECT name FROM polling_centers WHERE center_number = '3002'", [], |row| {
                row.get(0)
            })
            .expect("name should read");
        assert_eq!(name, "Real Center");
    }

    #[test]
    fn upsert_polling_center_promotes_placeholder_rows() {
        let connection = open_test_store();
        get_or_create_placeholder_center(
            &connection,
            &PlaceholderCenter {
                center_number: "3001",
                name: "From voter",
                governorate: None,
                registration_center_number: None,
                registration_center_name: None,
                registration_center_id: None,
            },
            "t",
        )
        .expect("placeholder should insert");

        let record = PollingCenterRecord {
            center_number: "3001".to_string(),
            name: "Al-Zubair School".to_string(),
            station_count: 4,
            ..PollingCenterRecord::default()
        };
        let (_, created) =
            upsert_polling_center(&connection, &record, "general", None, "t2").expect("upsert");
        assert!(!created);

        let (name, placeholder, count): (String, i64, i64) = connection
            .query_row(
                "SELECT name, is_placeholder, station_count FROM polling_centers",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .expect("center should read");
        assert_eq!(name, "Al-Zubair School");
        assert_eq!(placeholder, 0);
        assert_eq!(count, 4);
    }

    #[test]
    fn station_identity_is_center_and_number() {
        let connection = open_test_store();
        let record = PollingCenterRecord {
            center_number: "3001".to_string(),
            name: "School".to_string(),
            station_count: 2,
            ..PollingCenterRecord::default()
        };
        let (center_id, _) =
            upsert_polling_center(&connection, &record, "general", None, "t").expect("upsert");

        let (a, created_a) =
            get_or_create_station(&connection, center_id, "3001", 1, "t").expect("station");
        let (b, created_b) =
            get_or_create_station(&connection, center_id, "3001", 1, "t").expect("station");
        assert!(created_a);
        assert!(!created_b);
        assert_eq!(a, b);

        let stations = load_stations(&connection).expect("stations should load");
        assert_eq!(stations.get(&(center_id, 1)), Some(&a));
        let full_number: String = connection
            .query_row("SELECT full_number FROM polling_stations", [], |row| row.get(0))
            .expect("full number should read");
        assert_eq!(full_number, "3001-1");
    }
}
