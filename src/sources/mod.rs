use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;

use anyhow::Result;
use chrono::NaiveDate;

use crate::cli::SourceFormat;
use crate::error::RecordError;
use crate::model::RecordKind;
use crate::util::sha256_file;

mod delimited;
mod json_batch;
mod legacy;
mod spreadsheet;
#[cfg(test)]
mod tests;

pub use json_batch::{BatchFile, list_batch_files, open_json_batch};

/// An untyped value as it came out of the source.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
}

impl RawValue {
    /// Renders the value the way it is stored: trimmed text, integers and
    /// whole floats without a decimal point, ISO dates.
    pub fn render(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Text(text) => Some(text.trim().to_string()),
            Self::Integer(value) => Some(value.to_string()),
            Self::Float(value) if value.fract() == 0.0 && value.abs() < 1e15 => {
                Some(format!("{}", *value as i64))
            }
            Self::Float(value) => Some(value.to_string()),
            Self::Bool(value) => Some(value.to_string()),
            Self::Date(date) => Some(date.format("%Y-%m-%d").to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLocation {
    pub source: String,
    pub position: u64,
}

impl RecordLocation {
    pub fn new(source: &str, position: u64) -> Self {
        Self {
            source: source.to_string(),
            position,
        }
    }
}

impl fmt::Display for RecordLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.position)
    }
}

#[derive(Debug, Clone)]
pub struct RawRecord {
    pub location: RecordLocation,
    pub kind: RecordKind,
    pub source_pk: Option<i64>,
    pub fields: HashMap<String, RawValue>,
}

#[derive(Debug, Clone)]
pub struct RecordFailure {
    pub location: RecordLocation,
    pub error: RecordError,
}

pub type RecordResult = std::result::Result<RawRecord, RecordFailure>;

pub type RecordIter = Box<dyn Iterator<Item = RecordResult> + Send>;

pub struct RecordSource {
    pub label: String,
    pub total: Option<u64>,
    pub sha256: Option<String>,
    pub records: RecordIter,
}

impl fmt::Debug for RecordSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordSource")
            .field("label", &self.label)
            .field("total", &self.total)
            .finish_non_exhaustive()
    }
}

/// Everything needed to open one source.
#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub format: SourceFormat,
    pub path: PathBuf,
    /// Kind assigned to rows of tabular sources; JSON envelopes carry their own.
    pub default_kind: RecordKind,
    pub sheet: Option<String>,
    pub skip_rows: usize,
    pub table: Option<String>,
    pub start_batch: Option<u32>,
    pub end_batch: Option<u32>,
    pub exclude_batches: BTreeSet<u32>,
}

impl SourceSpec {
    pub fn new(format: SourceFormat, path: PathBuf, default_kind: RecordKind) -> Self {
        Self {
            format,
            path,
            default_kind,
            sheet: None,
            skip_rows: 0,
            table: None,
            start_batch: None,
            end_batch: None,
            exclude_batches: BTreeSet::new(),
        }
    }
}

/// Opens a source. Failure here is a configuration error and aborts the run
/// before any batch is written.
pub fn open_source(spec: &SourceSpec) -> Result<RecordSource> {
    let mut source = match spec.format {
        SourceFormat::Xlsx => {
            spreadsheet::open(&spec.path, spec.sheet.as_deref(), spec.skip_rows, spec.default_kind)?
        }
        SourceFormat::Csv => delimited::open(&spec.path, spec.skip_rows, spec.default_kind)?,
        SourceFormat::JsonBatch => open_json_batch(&spec.path)?,
        SourceFormat::JsonBatchDir => json_batch::open_directory(
            &spec.path,
            spec.start_batch,
            spec.end_batch,
            &spec.exclude_batches,
        )?,
        SourceFormat::LegacySqlite => legacy::open(&spec.path, spec.table.as_deref())?,
    };

    if spec.path.is_file() {
        source.sha256 = Some(sha256_file(&spec.path)?);
    }
    Ok(source)
}
