use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;
use std::path::Path;

use anyhow::{Result, bail};

use crate::sources::{RawRecord, RawValue};
use crate::util::read_json;

mod center;
mod voter;

pub use center::CenterField;
pub use voter::{FieldFilter, VoterField, parse_date};

/// A closed set of canonical target fields with their built-in aliases.
pub trait FieldSet: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    const ALL: &'static [Self];

    fn as_str(self) -> &'static str;

    /// Source column names tried in order; the first one present wins.
    fn default_aliases(self) -> &'static [&'static str];

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|field| field.as_str() == name)
    }
}

#[derive(Debug, Clone)]
pub struct AliasTable<F: FieldSet> {
    entries: Vec<(F, Vec<String>)>,
}

impl<F: FieldSet> AliasTable<F> {
    pub fn builtin() -> Self {
        let entries = F::ALL
            .iter()
            .map(|field| {
                let aliases = field
                    .default_aliases()
                    .iter()
                    .map(|alias| alias.to_string())
                    .collect();
                (*field, aliases)
            })
            .collect();
        Self { entries }
    }

    /// Loads `{ "<target>": ["alias", ...] }`. Targets named in the file
    /// replace their built-in alias list; the rest keep the built-in one.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let overrides: BTreeMap<String, Vec<String>> = read_json(path)?;
        let mut table = Self::builtin();
        for (target, aliases) in overrides {
            let Some(field) = F::from_name(&target) else {
                let known: Vec<&str> = F::ALL.iter().map(|f| f.as_str()).collect();
                bail!(
                    "unknown target field `{target}` in alias table {} (known: {})",
                    path.display(),
                    known.join(", ")
                );
            };
            table.set_aliases(field, aliases);
        }
        Ok(table)
    }

    pub fn set_aliases(&mut self, field: F, aliases: Vec<String>) {
        match self.entries.iter_mut().find(|(existing, _)| *existing == field) {
            Some(entry) => entry.1 = aliases,
            None => self.entries.push((field, aliases)),
        }
    }

    pub fn aliases(&self, field: F) -> &[String] {
        self.entries
            .iter()
            .find(|(existing, _)| *existing == field)
            .map(|(_, aliases)| aliases.as_slice())
            .unwrap_or(&[])
    }

    /// Renames source fields to canonical targets. Unrecognised source fields
    /// are dropped and a target with no alias present stays absent.
    pub fn map(&self, record: &RawRecord) -> MappedRecord<F> {
        let mut values = HashMap::new();
        for (field, aliases) in &self.entries {
            // A blank alias only wins when no later alias carries a value.
            let mut found: Option<String> = None;
            let present = aliases
                .iter()
                .filter_map(|alias| record.fields.get(alias))
                .filter_map(RawValue::render);
            for value in present {
                if !value.is_empty() {
                    found = Some(value);
                    break;
                }
                found.get_or_insert(value);
            }
            if let Some(value) = found {
                values.insert(*field, value);
            }
        }
        MappedRecord { values }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedRecord<F: FieldSet> {
    values: HashMap<F, String>,
}

impl<F: FieldSet> MappedRecord<F> {
    pub fn get(&self, field: F) -> Option<&str> {
        self.values.get(&field).map(String::as_str)
    }

    pub fn take(&mut self, field: F) -> Option<String> {
        self.values.remove(&field)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
