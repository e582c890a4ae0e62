use std::collections::HashMap;
use std::time::Instant;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use tracing::{debug, info, warn};

use crate::model::LinkStats;
use crate::store::count_rows;
use crate::store::hierarchy::{
    CenterEntry, PlaceholderCenter, centers_with_registration_numbers,
    get_or_create_placeholder_center, get_or_create_registration_center, get_or_create_station,
    load_polling_centers, load_registration_centers, load_stations, set_center_registration,
};
use crate::util::{non_empty, now_utc_string};

pub const DEFAULT_PAGE_SIZE: usize = 1_000;

/// Voters with at least one unset reference whose locator field is present.
const UNRESOLVED_FILTER: &str = "(polling_center_id IS NULL AND COALESCE(TRIM(voting_center_number), '') <> '')
     OR (polling_station_id IS NULL AND COALESCE(TRIM(voting_center_number), '') <> ''
         AND COALESCE(TRIM(station_number), '') <> '')
     OR (registration_center_id IS NULL AND COALESCE(TRIM(registration_center_number), '') <> '')";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkOptions {
    pub page_size: usize,
    pub limit: Option<u64>,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            limit: None,
        }
    }
}

#[derive(Debug)]
struct PendingVoter {
    id: i64,
    voting_center_number: Option<String>,
    voting_center_name: Option<String>,
    registration_center_number: Option<String>,
    registration_center_name: Option<String>,
    governorate: Option<String>,
    station_number: Option<String>,
    polling_center_id: Option<i64>,
    polling_station_id: Option<i64>,
    registration_center_id: Option<i64>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ResolvedRefs {
    polling_center_id: Option<i64>,
    polling_station_id: Option<i64>,
    registration_center_id: Option<i64>,
}

impl ResolvedRefs {
    fn is_empty(&self) -> bool {
        self.polling_center_id.is_none()
            && self.polling_station_id.is_none()
            && self.registration_center_id.is_none()
    }
}

/// Lookup tables loaded once per run and kept in step with rows created
/// during the run.
#[derive(Debug, Default)]
struct HierarchyCache {
    registration_centers: HashMap<String, i64>,
    polling_centers: HashMap<String, CenterEntry>,
    stations: HashMap<(i64, u32), i64>,
}

impl HierarchyCache {
    fn load(connection: &Connection) -> Result<Self> {
        let cache = Self {
            registration_centers: load_registration_centers(connection)?,
            polling_centers: load_polling_centers(connection)?,
            stations: load_stations(connection)?,
        };
        info!(
            registration_centers = cache.registration_centers.len(),
            polling_centers = cache.polling_centers.len(),
            stations = cache.stations.len(),
            "hierarchy caches loaded"
        );
        Ok(cache)
    }

    fn registration_center(
        &mut self,
        connection: &Connection,
        number: &str,
        name: Option<&str>,
        governorate: Option<&str>,
        now: &str,
        stats: &mut LinkStats,
    ) -> Result<i64> {
        if let Some(id) = self.registration_centers.get(number) {
            return Ok(*id);
        }
        let (id, created) =
            get_or_create_registration_center(connection, number, name, governorate, now)?;
        if created {
            stats.registration_centers_created += 1;
            debug!(center_number = %number, "registration center created");
        }
        self.registration_centers.insert(number.to_string(), id);
        Ok(id)
    }

    fn polling_center(
        &mut self,
        connection: &Connection,
        voter: &PendingVoter,
        number: &str,
        registration_center_id: Option<i64>,
        now: &str,
        stats: &mut LinkStats,
    ) -> Result<CenterEntry> {
        if let Some(entry) = self.polling_centers.get(number) {
            return Ok(*entry);
        }
        let fallback_name = format!("Polling center {number}");
        let placeholder = PlaceholderCenter {
            center_number: number,
            name: non_empty(voter.voting_center_name.as_deref()).unwrap_or(fallback_name.as_str()),
            governorate: non_empty(voter.governorate.as_deref()),
            registration_center_number: non_empty(voter.registration_center_number.as_deref()),
            registration_center_name: non_empty(voter.registration_center_name.as_deref()),
            registration_center_id,
        };
        let (entry, created) = get_or_create_placeholder_center(connection, &placeholder, now)?;
        if created {
            stats.placeholder_centers_created += 1;
            debug!(center_number = %number, "placeholder polling center created");
        }
        self.polling_centers.insert(number.to_string(), entry);
        Ok(entry)
    }

    fn station(
        &mut self,
        connection: &Connection,
        center: CenterEntry,
        center_number: &str,
        station_number: u32,
        now: &str,
        stats: &mut LinkStats,
    ) -> Result<i64> {
        if let Some(id) = self.stations.get(&(center.id, station_number)) {
            return Ok(*id);
        }
        if center.station_count > 0 && station_number > center.station_count {
            stats.out_of_range_stations += 1;
            warn!(
                center_number = %center_number,
                station_number,
                station_count = center.station_count,
                "station number outside declared station count"
            );
        }
        let (id, created) =
            get_or_create_station(connection, center.id, center_number, station_number, now)?;
        if created {
            stats.stations_created += 1;
        }
        self.stations.insert((center.id, station_number), id);
        Ok(id)
    }
}

pub fn count_unresolved(connection: &Connection) -> Result<i64> {
    count_rows(
        connection,
        &format!("SELECT COUNT(*) FROM voters WHERE {UNRESOLVED_FILTER}"),
    )
}

/// Links polling centers to their registration centers, then resolves voter
/// references page by page. Each page commits in one transaction; a failed
/// page aborts the run and leaves earlier pages committed.
pub fn link_hierarchy(connection: &mut Connection, options: &LinkOptions) -> Result<LinkStats> {
    let started = Instant::now();
    let page_size = options.page_size.max(1);
    let mut stats = LinkStats::default();
    let mut cache = HierarchyCache::load(connection)?;

    link_polling_centers(connection, &mut cache, &mut stats)?;

    let mut last_id = 0_i64;
    loop {
        let remaining = options
            .limit
            .map(|limit| limit.saturating_sub(stats.voters_examined));
        if remaining == Some(0) {
            break;
        }
        let fetch = remaining.map_or(page_size, |left| page_size.min(left as usize));
        let page = load_page(connection, last_id, fetch)?;
        let Some(last) = page.last() else {
            break;
        };
        last_id = last.id;
        stats.pages += 1;

        let now = now_utc_string();
        let tx = connection
            .transaction()
            .context("failed to open link transaction")?;
        for voter in &page {
            stats.voters_examined += 1;
            let refs = resolve_voter(&tx, &mut cache, voter, &now, &mut stats)?;
            if refs.is_empty() {
                continue;
            }
            write_refs(&tx, voter.id, refs, &now)?;
            stats.voters_linked += 1;
            stats.center_refs_set += u64::from(refs.polling_center_id.is_some());
            stats.station_refs_set += u64::from(refs.polling_station_id.is_some());
            stats.registration_refs_set += u64::from(refs.registration_center_id.is_some());
        }
        tx.commit()
            .with_context(|| format!("failed to commit link page ending at voter id {last_id}"))?;

        info!(
            page = stats.pages,
            last_id,
            examined = stats.voters_examined,
            linked = stats.voters_linked,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "link page committed"
        );
    }

    if stats.unparseable_station_numbers > 0 {
        warn!(
            voters = stats.unparseable_station_numbers,
            "voters with unparseable station numbers left unlinked"
        );
    }
    info!(
        examined = stats.voters_examined,
        linked = stats.voters_linked,
        registration_centers_created = stats.registration_centers_created,
        placeholder_centers_created = stats.placeholder_centers_created,
        stations_created = stats.stations_created,
        out_of_range_stations = stats.out_of_range_stations,
        "hierarchy link finished"
    );
    Ok(stats)
}

fn link_polling_centers(
    connection: &mut Connection,
    cache: &mut HierarchyCache,
    stats: &mut LinkStats,
) -> Result<()> {
    let now = now_utc_string();
    let tx = connection.transaction()?;
    for center in centers_with_registration_numbers(&tx)? {
        let id = cache.registration_center(
            &tx,
            &center.registration_center_number,
            non_empty(center.registration_center_name.as_deref()),
            non_empty(center.governorate.as_deref()),
            &now,
            stats,
        )?;
        if center.registration_center_id != Some(id) {
            set_center_registration(&tx, center.center_id, id)?;
            stats.polling_centers_linked += 1;
        }
    }
    tx.commit().context("failed to commit polling center links")?;
    Ok(())
}

fn load_page(connection: &Connection, after_id: i64, size: usize) -> Result<Vec<PendingVoter>> {
    let mut statement = connection.prepare_cached(&format!(
        "SELECT id, voting_center_number, voting_center_name, registration_center_number,
                registration_center_name, governorate, station_number,
                polling_center_id, polling_station_id, registration_center_id
         FROM voters
         WHERE id > ?1 AND ({UNRESOLVED_FILTER})
         ORDER BY id
         LIMIT ?2"
    ))?;
    let rows = statement.query_map(params![after_id, size as i64], |row| {
        Ok(PendingVoter {
            id: row.get(0)?,
            voting_center_number: row.get(1)?,
            voting_center_name: row.get(2)?,
            registration_center_number: row.get(3)?,
            registration_center_name: row.get(4)?,
            governorate: row.get(5)?,
            station_number: row.get(6)?,
            polling_center_id: row.get(7)?,
            polling_station_id: row.get(8)?,
            registration_center_id: row.get(9)?,
        })
    })?;

    let mut page = Vec::with_capacity(size);
    for row in rows {
        page.push(row?);
    }
    Ok(page)
}

fn resolve_voter(
    connection: &Connection,
    cache: &mut HierarchyCache,
    voter: &PendingVoter,
    now: &str,
    stats: &mut LinkStats,
) -> Result<ResolvedRefs> {
    let mut refs = ResolvedRefs::default();

    let registration_center_id = match voter.registration_center_id {
        Some(id) => Some(id),
        None => match non_empty(voter.registration_center_number.as_deref()) {
            Some(number) => {
                let id = cache.registration_center(
                    connection,
                    number,
                    non_empty(voter.registration_center_name.as_deref()),
                    non_empty(voter.governorate.as_deref()),
                    now,
                    stats,
                )?;
                refs.registration_center_id = Some(id);
                Some(id)
            }
            None => None,
        },
    };

    let Some(center_number) = non_empty(voter.voting_center_number.as_deref()) else {
        return Ok(refs);
    };
    let center = cache.polling_center(
        connection,
        voter,
        center_number,
        registration_center_id,
        now,
        stats,
    )?;
    if voter.polling_center_id.is_none() {
        refs.polling_center_id = Some(center.id);
    }

    if voter.polling_station_id.is_some() {
        return Ok(refs);
    }
    let Some(raw_station) = non_empty(voter.station_number.as_deref()) else {
        return Ok(refs);
    };
    match parse_station_number(raw_station) {
        Some(station_number) => {
            let id = cache.station(connection, center, center_number, station_number, now, stats)?;
            refs.polling_station_id = Some(id);
        }
        None => {
            stats.unparseable_station_numbers += 1;
            debug!(voter_id = voter.id, station_number = %raw_station, "unparseable station number");
        }
    }
    Ok(refs)
}

/// Station numbers are positive integers; sources sometimes carry `3.0`.
pub(super) fn parse_station_number(raw: &str) -> Option<u32> {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_suffix(".0")
        .unwrap_or(trimmed);
    digits.parse::<u32>().ok().filter(|number| *number >= 1)
}

fn write_refs(connection: &Connection, voter_id: i64, refs: ResolvedRefs, now: &str) -> Result<()> {
    let mut statement = connection.prepare_cached(
        "UPDATE voters SET
           polling_center_id = COALESCE(polling_center_id, ?1),
           polling_station_id = COALESCE(polling_station_id, ?2),
           registration_center_id = COALESCE(registration_center_id, ?3),
           updated_at = ?4
         WHERE id = ?5",
    )?;
    statement
        .execute(params![
            refs.polling_center_id,
            refs.polling_station_id,
            refs.registration_center_id,
            now,
            voter_id
        ])
        .with_context(|| format!("failed to write references for voter id {voter_id}"))?;
    Ok(())
}
