use thiserror::Error;

/// Problems confined to a single source record. The run continues past them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("missing required field `{field}`")]
    MissingRequiredField { field: &'static str },

    #[error("unparseable date `{value}` in field `{field}`")]
    InvalidDate { field: &'static str, value: String },

    #[error("unknown model tag `{tag}`")]
    UnknownModel { tag: String },

    #[error("malformed record: {reason}")]
    Malformed { reason: String },

    #[error("unsupported cell in column `{column}`: {detail}")]
    UnsupportedCell { column: String, detail: String },
}

impl RecordError {
    /// Records without their natural key are skipped; every other record
    /// error counts as errored.
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::MissingRequiredField { .. })
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}
