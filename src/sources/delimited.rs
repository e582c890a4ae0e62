use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use csv::{ReaderBuilder, StringRecordsIntoIter, Trim};

use super::{RawRecord, RawValue, RecordFailure, RecordLocation, RecordResult, RecordSource};
use crate::error::RecordError;
use crate::model::RecordKind;

pub(super) fn open(path: &Path, skip_rows: usize, kind: RecordKind) -> Result<RecordSource> {
    let file = File::open(path)
        .with_context(|| format!("failed to open csv file: {}", path.display()))?;
    let label = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let rows = CsvRows::new(label.clone(), file, skip_rows, kind)
        .with_context(|| format!("failed to read csv header: {}", path.display()))?;

    Ok(RecordSource {
        label,
        total: None,
        sha256: None,
        records: Box::new(rows),
    })
}

pub(super) struct CsvRows<R: Read> {
    label: String,
    kind: RecordKind,
    headers: Vec<String>,
    rows: StringRecordsIntoIter<R>,
    line: u64,
    skip_rows: usize,
}

impl<R: Read> CsvRows<R> {
    pub(super) fn new(label: String, input: R, skip_rows: usize, kind: RecordKind) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .flexible(true)
            .trim(Trim::All)
            .from_reader(input);
        let headers = reader
            .headers()?
            .iter()
            .map(|header| header.trim_start_matches('\u{feff}').trim().to_string())
            .collect();

        Ok(Self {
            label,
            kind,
            headers,
            rows: reader.into_records(),
            line: 1,
            skip_rows,
        })
    }
}

impl<R: Read> Iterator for CsvRows<R> {
    type Item = RecordResult;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let row = self.rows.next()?;
            self.line += 1;
            if self.skip_rows > 0 {
                self.skip_rows -= 1;
                continue;
            }

            let location = RecordLocation::new(&self.label, self.line);
            let row = match row {
                Ok(row) => row,
                Err(err) => {
                    return Some(Err(RecordFailure {
                        location,
                        error: RecordError::malformed(err.to_string()),
                    }));
                }
            };

            let fields: HashMap<String, RawValue> = self
                .headers
                .iter()
                .zip(row.iter())
                .filter(|(header, value)| !header.is_empty() && !value.is_empty())
                .map(|(header, value)| (header.clone(), RawValue::Text(value.to_string())))
                .collect();
            if fields.is_empty() {
                continue;
            }

            return Some(Ok(RawRecord {
                location,
                kind: self.kind,
                source_pk: None,
                fields,
            }));
        }
    }
}
