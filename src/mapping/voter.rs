use std::str::FromStr;

use anyhow::{Context, Error, Result, bail};
use chrono::NaiveDate;
use tracing::warn;

use super::{FieldSet, MappedRecord};
use crate::error::RecordError;
use crate::model::VoterRecord;

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d"];
const CLASSIFICATIONS: [&str; 4] = ["supporter", "neutral", "opponent", "unknown"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoterField {
    VoterNumber,
    FullName,
    FirstName,
    FatherName,
    GrandfatherName,
    MotherName,
    DateOfBirth,
    Phone,
    FamilyNumber,
    Governorate,
    Status,
    Classification,
    VotingCenterNumber,
    VotingCenterName,
    RegistrationCenterNumber,
    RegistrationCenterName,
    StationNumber,
}

impl FieldSet for VoterField {
    const ALL: &'static [Self] = &[
        Self::VoterNumber,
        Self::FullName,
        Self::FirstName,
        Self::FatherName,
        Self::GrandfatherName,
        Self::MotherName,
        Self::DateOfBirth,
        Self::Phone,
        Self::FamilyNumber,
        Self::Governorate,
        Self::Status,
        Self::Classification,
        Self::VotingCenterNumber,
        Self::VotingCenterName,
        Self::RegistrationCenterNumber,
        Self::RegistrationCenterName,
        Self::StationNumber,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::VoterNumber => "voter_number",
            Self::FullName => "full_name",
            Self::FirstName => "first_name",
            Self::FatherName => "father_name",
            Self::GrandfatherName => "grandfather_name",
            Self::MotherName => "mother_name",
            Self::DateOfBirth => "date_of_birth",
            Self::Phone => "phone",
            Self::FamilyNumber => "family_number",
            Self::Governorate => "governorate",
            Self::Status => "status",
            Self::Classification => "classification",
            Self::VotingCenterNumber => "voting_center_number",
            Self::VotingCenterName => "voting_center_name",
            Self::RegistrationCenterNumber => "registration_center_number",
            Self::RegistrationCenterName => "registration_center_name",
            Self::StationNumber => "station_number",
        }
    }

    fn default_aliases(self) -> &'static [&'static str] {
        match self {
            Self::VoterNumber => &[
                "VoterNumber",
                "voter_number",
                "رقم_الناخب",
                "ID",
                "VoterID",
                "per_id",
            ],
            Self::FullName => &["Name", "FullName", "full_name", "الاسم", "الاسم_الكامل"],
            Self::FirstName => &["FirstName", "first_name", "per_first"],
            Self::FatherName => &["FatherName", "father_name", "per_father"],
            Self::GrandfatherName => &["GrandfatherName", "grandfather_name", "per_grand"],
            Self::MotherName => &["MotherName", "mother_name", "اسم_الأم", "MotherFullName"],
            Self::DateOfBirth => &[
                "BirthDate",
                "DateOfBirth",
                "date_of_birth",
                "تاريخ_الميلاد",
                "DOB",
                "per_dob",
            ],
            Self::Phone => &["Phone", "phone", "Mobile", "PhoneNumber", "الهاتف"],
            Self::FamilyNumber => &[
                "FamilyNumber",
                "family_number",
                "رقم_العائلة",
                "FamilyID",
                "per_famno",
            ],
            Self::Governorate => &["Governorate", "governorate", "المحافظة", "Province"],
            Self::Status => &["Status", "status", "الحالة", "VoterStatus"],
            Self::Classification => &["Classification", "classification", "التصنيف"],
            Self::VotingCenterNumber => &[
                "PollingCenterNumber",
                "VotingCenterNumber",
                "voting_center_number",
                "رقم_المركز",
                "pcno",
            ],
            Self::VotingCenterName => &[
                "PollingCenterName",
                "VotingCenterName",
                "voting_center_name",
                "اسم_المركز",
                "pc_name",
            ],
            Self::RegistrationCenterNumber => &[
                "RegistrationCenterNumber",
                "RegCenterNumber",
                "registration_center_number",
                "رقم_مركز_التسجيل",
                "per_vrc_id",
            ],
            Self::RegistrationCenterName => &[
                "RegistrationCenterName",
                "RegCenterName",
                "registration_center_name",
                "مركز_التسجيل",
            ],
            Self::StationNumber => &[
                "StationNumber",
                "station_number",
                "رقم_المحطة",
                "StationNo",
                "psno",
            ],
        }
    }
}

/// Parses the date formats seen in voter sources into an ISO date. Datetime
/// values are accepted by their date prefix.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    let date_part = trimmed
        .split(['T', ' '])
        .next()
        .unwrap_or(trimmed);
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(date_part, format).ok())
}

impl VoterRecord {
    /// Builds the canonical record from mapped fields. A missing voter number
    /// rejects the record; an unparseable birth date is a record error.
    pub fn from_mapped(
        mut mapped: MappedRecord<VoterField>,
        source_pk: Option<i64>,
    ) -> Result<Self, RecordError> {
        let voter_number = mapped
            .take(VoterField::VoterNumber)
            .filter(|value| !value.is_empty())
            .ok_or(RecordError::MissingRequiredField {
                field: VoterField::VoterNumber.as_str(),
            })?;

        let date_of_birth = match mapped.take(VoterField::DateOfBirth) {
            Some(raw) if raw.is_empty() => Some(raw),
            Some(raw) => match parse_date(&raw) {
                Some(date) => Some(date.format("%Y-%m-%d").to_string()),
                None => {
                    return Err(RecordError::InvalidDate {
                        field: VoterField::DateOfBirth.as_str(),
                        value: raw,
                    });
                }
            },
            None => None,
        };

        let full_name = mapped
            .take(VoterField::FullName)
            .or_else(|| compose_full_name(&mut mapped));
        let classification = mapped
            .take(VoterField::Classification)
            .and_then(|value| normalize_classification(&value));

        Ok(Self {
            source_pk,
            voter_number,
            full_name,
            mother_name: mapped.take(VoterField::MotherName),
            date_of_birth,
            phone: mapped.take(VoterField::Phone),
            family_number: mapped.take(VoterField::FamilyNumber),
            governorate: mapped.take(VoterField::Governorate),
            status: mapped.take(VoterField::Status),
            classification,
            voting_center_number: mapped.take(VoterField::VotingCenterNumber),
            voting_center_name: mapped.take(VoterField::VotingCenterName),
            registration_center_number: mapped.take(VoterField::RegistrationCenterNumber),
            registration_center_name: mapped.take(VoterField::RegistrationCenterName),
            station_number: mapped.take(VoterField::StationNumber),
        })
    }
}

fn compose_full_name(mapped: &mut MappedRecord<VoterField>) -> Option<String> {
    let parts: Vec<String> = [
        VoterField::FirstName,
        VoterField::FatherName,
        VoterField::GrandfatherName,
    ]
    .into_iter()
    .filter_map(|field| mapped.take(field))
    .filter(|part| !part.is_empty())
    .collect();

    (!parts.is_empty()).then(|| parts.join(" "))
}

/// Empty classifications are treated as absent; unrecognised ones become
/// `unknown`.
fn normalize_classification(value: &str) -> Option<String> {
    let lowered = value.trim().to_lowercase();
    if lowered.is_empty() {
        return None;
    }
    match CLASSIFICATIONS.iter().find(|candidate| **candidate == lowered) {
        Some(known) => Some(known.to_string()),
        None => {
            warn!(classification = %value, "unrecognised classification stored as unknown");
            Some("unknown".to_string())
        }
    }
}

/// `--filter field=value`: exact match on a canonical voter column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFilter {
    pub field: VoterField,
    pub value: String,
}

impl FieldFilter {
    pub fn matches(&self, record: &VoterRecord) -> bool {
        record.column_value(self.field.as_str()) == Some(self.value.as_str())
    }
}

impl FromStr for FieldFilter {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        let (name, value) = raw
            .split_once('=')
            .with_context(|| format!("filter `{raw}` must look like field=value"))?;
        let name = name.trim();
        let Some(field) = VoterField::from_name(name) else {
            bail!("unknown filter field `{name}`");
        };
        if matches!(
            field,
            VoterField::FirstName | VoterField::FatherName | VoterField::GrandfatherName
        ) {
            bail!("filter field `{name}` is not stored; filter on full_name instead");
        }
        Ok(Self {
            field,
            value: value.trim().to_string(),
        })
    }
}

impl std::fmt::Display for FieldFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.field.as_str(), self.value)
    }
}
