use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RecordError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Voter,
    PollingCenter,
    PollingStation,
    RegistrationCenter,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Voter => "voter",
            Self::PollingCenter => "polling_center",
            Self::PollingStation => "polling_station",
            Self::RegistrationCenter => "registration_center",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts both bare tags (`voter`) and app-qualified tags (`elections.voter`).
impl FromStr for RecordKind {
    type Err = RecordError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        let bare = tag.rsplit('.').next().unwrap_or(tag).trim();
        match bare.to_ascii_lowercase().replace('_', "").as_str() {
            "voter" => Ok(Self::Voter),
            "pollingcenter" => Ok(Self::PollingCenter),
            "pollingstation" => Ok(Self::PollingStation),
            "registrationcenter" => Ok(Self::RegistrationCenter),
            _ => Err(RecordError::UnknownModel {
                tag: tag.to_string(),
            }),
        }
    }
}

/// Canonical voter record. `Some("")` means the source carried the field with
/// an empty value; `None` means the source did not carry it at all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VoterRecord {
    pub source_pk: Option<i64>,
    pub voter_number: String,
    pub full_name: Option<String>,
    pub mother_name: Option<String>,
    pub date_of_birth: Option<String>,
    pub phone: Option<String>,
    pub family_number: Option<String>,
    pub governorate: Option<String>,
    pub status: Option<String>,
    pub classification: Option<String>,
    pub voting_center_number: Option<String>,
    pub voting_center_name: Option<String>,
    pub registration_center_number: Option<String>,
    pub registration_center_name: Option<String>,
    pub station_number: Option<String>,
}

impl VoterRecord {
    /// Every mutable column with the value this record carries for it.
    pub fn column_values(&self) -> [(&'static str, Option<&str>); 14] {
        [
            ("full_name", self.full_name.as_deref()),
            ("mother_name", self.mother_name.as_deref()),
            ("date_of_birth", self.date_of_birth.as_deref()),
            ("phone", self.phone.as_deref()),
            ("family_number", self.family_number.as_deref()),
            ("governorate", self.governorate.as_deref()),
            ("status", self.status.as_deref()),
            ("classification", self.classification.as_deref()),
            ("voting_center_number", self.voting_center_number.as_deref()),
            ("voting_center_name", self.voting_center_name.as_deref()),
            (
                "registration_center_number",
                self.registration_center_number.as_deref(),
            ),
            (
                "registration_center_name",
                self.registration_center_name.as_deref(),
            ),
            ("station_number", self.station_number.as_deref()),
            ("voter_number", Some(self.voter_number.as_str())),
        ]
    }

    pub fn column_value(&self, column: &str) -> Option<&str> {
        self.column_values()
            .into_iter()
            .find(|(name, _)| *name == column)
            .and_then(|(_, value)| value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollingCenterRecord {
    pub center_number: String,
    pub name: String,
    pub governorate: Option<String>,
    pub address: Option<String>,
    pub location: Option<String>,
    pub registration_center_number: Option<String>,
    pub registration_center_name: Option<String>,
    pub station_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFailure {
    pub batch_number: u64,
    pub record_count: usize,
    pub first_key: Option<String>,
    pub last_key: Option<String>,
    pub offending_key: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordErrorEntry {
    pub location: String,
    /// Natural key of the rejected row when one was present.
    pub key: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportRunStats {
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errored: u64,
    pub filtered_out: u64,
    pub missing_key: u64,
    pub conflicts_absorbed: u64,
    /// Voters stored under a fresh id because their source primary key was taken.
    #[serde(default)]
    pub pk_reassigned: u64,
    pub batches: u64,
    pub batch_failures: Vec<BatchFailure>,
    pub record_errors: Vec<RecordErrorEntry>,
    pub record_errors_truncated: bool,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCheckpoint {
    pub batch_id: String,
    pub batch_number: Option<u32>,
    pub last_pk: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSummary {
    pub format: String,
    pub path: String,
    pub label: String,
    pub sha256: Option<String>,
    pub total_records: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportOptionsSummary {
    pub batch_size: usize,
    pub policy: String,
    pub empty_values: Option<String>,
    pub offset: u64,
    pub limit: Option<u64>,
    pub filters: Vec<String>,
    pub dry_run: bool,
    pub excluded_batches: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub db_schema_version: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub command: String,
    pub source: SourceSummary,
    pub options: ImportOptionsSummary,
    pub stats: ImportRunStats,
    pub voters_total: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkStats {
    pub registration_centers_created: u64,
    pub polling_centers_linked: u64,
    pub placeholder_centers_created: u64,
    pub stations_created: u64,
    pub out_of_range_stations: u64,
    pub unparseable_station_numbers: u64,
    pub voters_examined: u64,
    pub voters_linked: u64,
    pub center_refs_set: u64,
    pub station_refs_set: u64,
    pub registration_refs_set: u64,
    pub pages: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub db_schema_version: String,
    pub started_at: String,
    pub updated_at: String,
    pub batch_size: usize,
    pub limit: Option<u64>,
    pub working_set_before: i64,
    pub working_set_after: i64,
    pub stats: LinkStats,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CenterImportStats {
    pub rows: u64,
    pub centers_created: u64,
    pub centers_updated: u64,
    pub registration_centers_created: u64,
    pub stations_created: u64,
    pub station_counts_coerced: u64,
    pub skipped: u64,
    pub errored: u64,
    pub row_errors: Vec<RecordErrorEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CenterImportManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub db_schema_version: String,
    pub started_at: String,
    pub updated_at: String,
    pub voting_type: String,
    pub source: SourceSummary,
    pub stats: CenterImportStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchAuditEntry {
    pub batch_id: String,
    pub batch_number: Option<u32>,
    pub last_pk: i64,
    pub applied: bool,
    pub record_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportRound {
    pub round: usize,
    pub batches: Vec<u32>,
    pub start_batch: u32,
    pub end_batch: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub manifest_version: u32,
    pub generated_at: String,
    pub voters_total: i64,
    pub expected_count: Option<u64>,
    pub completion_percent: Option<f64>,
    pub applied: Vec<String>,
    pub missing: Vec<String>,
    pub applied_ranges: String,
    pub missing_ranges: String,
    pub missing_record_count: u64,
    pub missing_without_batch_file: Vec<String>,
    pub rounds: Vec<ImportRound>,
    pub entries: Vec<BatchAuditEntry>,
}
