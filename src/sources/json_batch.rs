use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{
    RawRecord, RawValue, RecordFailure, RecordIter, RecordLocation, RecordResult, RecordSource,
};
use crate::error::RecordError;
use crate::model::RecordKind;
use crate::util::BatchNumberPattern;

#[derive(Debug, Deserialize)]
struct Envelope {
    model: String,
    #[serde(default)]
    pk: Option<Value>,
    #[serde(default)]
    fields: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFile {
    pub number: u32,
    pub name: String,
    pub path: PathBuf,
}

/// Lists `*.json`/`*.jsonl` files carrying a batch number, in batch order.
pub fn list_batch_files(dir: &Path) -> Result<Vec<BatchFile>> {
    if !dir.is_dir() {
        bail!("batch directory not found: {}", dir.display());
    }

    let pattern = BatchNumberPattern::new()?;
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)
        .with_context(|| format!("failed to read batch directory: {}", dir.display()))?
    {
        let path = entry?.path();
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json") || ext.eq_ignore_ascii_case("jsonl"));
        if !is_json || !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        match pattern.number(&name) {
            Some(number) => files.push(BatchFile { number, name, path }),
            None => debug!(file = %name, "ignoring json file without batch number"),
        }
    }

    files.sort_by(|a, b| a.number.cmp(&b.number).then_with(|| a.name.cmp(&b.name)));
    Ok(files)
}

/// Opens a single batch file, either a JSON array of envelopes or one envelope
/// per line.
pub fn open_json_batch(path: &Path) -> Result<RecordSource> {
    let label = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let file = File::open(path)
        .with_context(|| format!("failed to open batch file: {}", path.display()))?;
    let mut reader = BufReader::new(file);

    if first_significant_byte(&mut reader)? == Some(b'[') {
        let elements: Vec<Value> = serde_json::from_reader(reader)
            .with_context(|| format!("failed to parse batch array: {}", path.display()))?;
        let total = elements.len() as u64;
        let source = label.clone();
        let records = elements
            .into_iter()
            .enumerate()
            .map(move |(index, element)| {
                let location = RecordLocation::new(&source, index as u64 + 1);
                match serde_json::from_value::<Envelope>(element) {
                    Ok(envelope) => envelope_record(envelope, location),
                    Err(err) => Err(RecordFailure {
                        location,
                        error: RecordError::malformed(err.to_string()),
                    }),
                }
            });
        return Ok(RecordSource {
            label,
            total: Some(total),
            sha256: None,
            records: Box::new(records),
        });
    }

    Ok(RecordSource {
        label: label.clone(),
        total: None,
        sha256: None,
        records: Box::new(JsonLines {
            label,
            lines: reader.lines(),
            line: 0,
        }),
    })
}

pub(super) fn open_directory(
    dir: &Path,
    start_batch: Option<u32>,
    end_batch: Option<u32>,
    exclude: &BTreeSet<u32>,
) -> Result<RecordSource> {
    let files: Vec<BatchFile> = list_batch_files(dir)?
        .into_iter()
        .filter(|file| start_batch.is_none_or(|start| file.number >= start))
        .filter(|file| end_batch.is_none_or(|end| file.number <= end))
        .filter(|file| !exclude.contains(&file.number))
        .collect();

    if files.is_empty() {
        bail!("no batch files selected in {}", dir.display());
    }
    for file in &files {
        File::open(&file.path)
            .with_context(|| format!("failed to open batch file: {}", file.path.display()))?;
    }

    let label = format!(
        "{} [batches {}..={}]",
        dir.display(),
        files.first().map_or(0, |f| f.number),
        files.last().map_or(0, |f| f.number)
    );
    let records = files.into_iter().flat_map(|file| -> RecordIter {
        match open_json_batch(&file.path) {
            Ok(source) => source.records,
            Err(err) => Box::new(std::iter::once(Err(RecordFailure {
                location: RecordLocation::new(&file.name, 0),
                error: RecordError::malformed(format!("{err:#}")),
            }))),
        }
    });

    Ok(RecordSource {
        label,
        total: None,
        sha256: None,
        records: Box::new(records),
    })
}

struct JsonLines {
    label: String,
    lines: Lines<BufReader<File>>,
    line: u64,
}

impl Iterator for JsonLines {
    type Item = RecordResult;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = self.lines.next()?;
            self.line += 1;
            let location = RecordLocation::new(&self.label, self.line);
            let text = match line {
                Ok(text) => text,
                Err(err) => {
                    return Some(Err(RecordFailure {
                        location,
                        error: RecordError::malformed(err.to_string()),
                    }));
                }
            };
            let text = text.trim().trim_end_matches(',');
            if text.is_empty() {
                continue;
            }
            return Some(match serde_json::from_str::<Envelope>(text) {
                Ok(envelope) => envelope_record(envelope, location),
                Err(err) => Err(RecordFailure {
                    location,
                    error: RecordError::malformed(err.to_string()),
                }),
            });
        }
    }
}

fn envelope_record(envelope: Envelope, location: RecordLocation) -> RecordResult {
    let kind = match envelope.model.parse::<RecordKind>() {
        Ok(kind) => kind,
        Err(error) => return Err(RecordFailure { location, error }),
    };
    let source_pk = envelope.pk.as_ref().and_then(pk_value);
    let fields: HashMap<String, RawValue> = envelope
        .fields
        .into_iter()
        .filter_map(|(name, value)| json_value(value).map(|value| (name, value)))
        .collect();

    Ok(RawRecord {
        location,
        kind,
        source_pk,
        fields,
    })
}

fn pk_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn json_value(value: Value) -> Option<RawValue> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(RawValue::Text(text)),
        Value::Bool(flag) => Some(RawValue::Bool(flag)),
        Value::Number(number) => match number.as_i64() {
            Some(int) => Some(RawValue::Integer(int)),
            None => number.as_f64().map(RawValue::Float),
        },
        other => Some(RawValue::Text(other.to_string())),
    }
}

fn first_significant_byte(reader: &mut BufReader<File>) -> Result<Option<u8>> {
    loop {
        let buf = reader.fill_buf().context("failed to read batch file")?;
        if buf.is_empty() {
            return Ok(None);
        }
        let skip = buf
            .iter()
            .take_while(|byte| byte.is_ascii_whitespace() || matches!(byte, 0xEF | 0xBB | 0xBF))
            .count();
        if skip < buf.len() {
            let byte = buf[skip];
            reader.consume(skip);
            return Ok(Some(byte));
        }
        let consumed = buf.len();
        reader.consume(consumed);
    }
}
