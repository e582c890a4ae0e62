use tracing::warn;

use super::{FieldSet, MappedRecord};
use crate::error::RecordError;
use crate::model::PollingCenterRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CenterField {
    CenterNumber,
    Name,
    CardName,
    Governorate,
    Address,
    Location,
    RegistrationCenterNumber,
    RegistrationCenterName,
    StationCount,
}

impl FieldSet for CenterField {
    const ALL: &'static [Self] = &[
        Self::CenterNumber,
        Self::Name,
        Self::CardName,
        Self::Governorate,
        Self::Address,
        Self::Location,
        Self::RegistrationCenterNumber,
        Self::RegistrationCenterName,
        Self::StationCount,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::CenterNumber => "center_number",
            Self::Name => "name",
            Self::CardName => "card_name",
            Self::Governorate => "governorate",
            Self::Address => "address",
            Self::Location => "location",
            Self::RegistrationCenterNumber => "registration_center_number",
            Self::RegistrationCenterName => "registration_center_name",
            Self::StationCount => "station_count",
        }
    }

    fn default_aliases(self) -> &'static [&'static str] {
        match self {
            Self::CenterNumber => &[
                "CenterNumber",
                "PollingCenterNumber",
                "center_number",
                "رقم مركز الاقتراع",
                "رقم المركز",
                "pcno",
            ],
            Self::Name => &[
                "CenterName",
                "PollingCenterName",
                "name",
                "الاسم الفعلي للمركز",
                "اسم مركز الاقتراع",
                "pc_name",
            ],
            Self::CardName => &["CardName", "card_name", "اسم المركز في البطاقة"],
            Self::Governorate => &["Governorate", "governorate", "المحافظة"],
            Self::Address => &["Address", "address", "عنوان مركز الاقتراع", "العنوان"],
            Self::Location => &["Location", "location", "الموقع"],
            Self::RegistrationCenterNumber => &[
                "RegistrationCenterNumber",
                "registration_center_number",
                "رقم مركز التسجيل",
            ],
            Self::RegistrationCenterName => &[
                "RegistrationCenterName",
                "registration_center_name",
                "اسم مركز التسجيل",
            ],
            Self::StationCount => &[
                "StationCount",
                "station_count",
                "عدد المحطات",
                "المحطات",
                "pc_count",
            ],
        }
    }
}

impl PollingCenterRecord {
    /// A row without a center number is rejected. Station counts that are
    /// missing, zero or unparseable default to one station.
    pub fn from_mapped(
        mut mapped: MappedRecord<CenterField>,
        default_governorate: Option<&str>,
    ) -> Result<(Self, bool), RecordError> {
        let center_number = mapped
            .take(CenterField::CenterNumber)
            .filter(|value| !value.is_empty())
            .ok_or(RecordError::MissingRequiredField {
                field: CenterField::CenterNumber.as_str(),
            })?;

        let raw_count = mapped.take(CenterField::StationCount);
        let parsed = raw_count
            .as_deref()
            .and_then(|value| value.trim().parse::<u32>().ok())
            .filter(|count| *count > 0);
        let coerced = parsed.is_none();
        if coerced {
            warn!(
                center = %center_number,
                station_count = raw_count.as_deref().unwrap_or(""),
                "station count defaulted to 1"
            );
        }

        let name = mapped
            .take(CenterField::Name)
            .filter(|value| !value.is_empty())
            .or_else(|| mapped.take(CenterField::CardName).filter(|value| !value.is_empty()))
            .unwrap_or_else(|| format!("Polling center {center_number}"));

        let record = Self {
            name,
            governorate: mapped
                .take(CenterField::Governorate)
                .or_else(|| default_governorate.map(str::to_string)),
            address: mapped.take(CenterField::Address),
            location: mapped.take(CenterField::Location),
            registration_center_number: mapped
                .take(CenterField::RegistrationCenterNumber)
                .filter(|value| !value.is_empty()),
            registration_center_name: mapped
                .take(CenterField::RegistrationCenterName)
                .filter(|value| !value.is_empty()),
            station_count: parsed.unwrap_or(1),
            center_number,
        };
        Ok((record, coerced))
    }
}
