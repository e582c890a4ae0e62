use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use calamine::{Data, Range, Reader, open_workbook_auto};

use super::{RawRecord, RawValue, RecordFailure, RecordLocation, RecordResult, RecordSource};
use crate::error::RecordError;
use crate::model::RecordKind;

pub(super) fn open(
    path: &Path,
    sheet: Option<&str>,
    skip_rows: usize,
    kind: RecordKind,
) -> Result<RecordSource> {
    let mut workbook = open_workbook_auto(path)
        .with_context(|| format!("failed to open spreadsheet: {}", path.display()))?;

    let sheet_name = match sheet {
        Some(name) => name.to_string(),
        None => workbook
            .sheet_names()
            .first()
            .cloned()
            .with_context(|| format!("spreadsheet has no sheets: {}", path.display()))?,
    };
    let range = workbook
        .worksheet_range(&sheet_name)
        .with_context(|| format!("failed to read sheet `{sheet_name}` in {}", path.display()))?;

    let label = path
        .file_name()
        .map(|name| format!("{}#{sheet_name}", name.to_string_lossy()))
        .unwrap_or_else(|| sheet_name.clone());
    let rows = SheetRows::new(label.clone(), range, skip_rows, kind)?;

    Ok(RecordSource {
        label,
        total: Some(rows.data_rows()),
        sha256: None,
        records: Box::new(rows),
    })
}

/// Rows of one worksheet keyed by the header row.
pub(super) struct SheetRows {
    label: String,
    kind: RecordKind,
    headers: Vec<String>,
    range: Range<Data>,
    first_data_row: usize,
    next_row: usize,
    height: usize,
}

impl SheetRows {
    pub(super) fn new(
        label: String,
        range: Range<Data>,
        skip_rows: usize,
        kind: RecordKind,
    ) -> Result<Self> {
        let (height, width) = range.get_size();
        if height == 0 {
            bail!("sheet is empty: {label}");
        }

        let headers = (0..width)
            .map(|col| range.get((0, col)).map(header_text).unwrap_or_default())
            .collect();
        let first_data_row = 1 + skip_rows;

        Ok(Self {
            label,
            kind,
            headers,
            range,
            first_data_row,
            next_row: first_data_row,
            height,
        })
    }

    pub(super) fn data_rows(&self) -> u64 {
        self.height.saturating_sub(self.first_data_row) as u64
    }

    fn read_row(&self, row: usize) -> Result<HashMap<String, RawValue>, RecordError> {
        let mut fields = HashMap::new();
        for (col, header) in self.headers.iter().enumerate() {
            if header.is_empty() {
                continue;
            }
            let Some(cell) = self.range.get((row, col)) else {
                continue;
            };
            match cell_value(cell) {
                Ok(RawValue::Null) => {}
                Ok(value) => {
                    fields.insert(header.clone(), value);
                }
                Err(detail) => {
                    return Err(RecordError::UnsupportedCell {
                        column: header.clone(),
                        detail,
                    });
                }
            }
        }
        Ok(fields)
    }
}

impl Iterator for SheetRows {
    type Item = RecordResult;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next_row < self.height {
            let row = self.next_row;
            self.next_row += 1;
            let location = RecordLocation::new(&self.label, row as u64 + 1);

            match self.read_row(row) {
                Ok(fields) if fields.is_empty() => continue,
                Ok(fields) => {
                    return Some(Ok(RawRecord {
                        location,
                        kind: self.kind,
                        source_pk: None,
                        fields,
                    }));
                }
                Err(error) => return Some(Err(RecordFailure { location, error })),
            }
        }
        None
    }
}

fn header_text(cell: &Data) -> String {
    match cell {
        Data::String(text) => text.trim().to_string(),
        Data::Empty => String::new(),
        other => other.to_string().trim().to_string(),
    }
}

pub(super) fn cell_value(cell: &Data) -> Result<RawValue, String> {
    match cell {
        Data::Empty => Ok(RawValue::Null),
        Data::String(text) if text.trim().is_empty() => Ok(RawValue::Null),
        Data::String(text) => Ok(RawValue::Text(text.trim().to_string())),
        Data::Int(value) => Ok(RawValue::Integer(*value)),
        Data::Float(value) => Ok(RawValue::Float(*value)),
        Data::Bool(value) => Ok(RawValue::Bool(*value)),
        Data::DateTime(value) => value
            .as_datetime()
            .map(|dt| RawValue::Date(dt.date()))
            .ok_or_else(|| format!("date serial out of range: {value:?}")),
        Data::DateTimeIso(text) | Data::DurationIso(text) => Ok(RawValue::Text(text.clone())),
        Data::Error(error) => Err(format!("cell error {error:?}")),
    }
}
