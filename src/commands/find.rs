use std::path::Path;

use anyhow::Result;
use tracing::{info, warn};

use crate::cli::FindArgs;
use crate::mapping::{AliasTable, VoterField};
use crate::model::RecordKind;
use crate::sources::{list_batch_files, open_json_batch};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoterMatch {
    pub file: String,
    pub batch_number: u32,
    pub position: u64,
    pub source_pk: Option<i64>,
}

pub fn run(args: FindArgs) -> Result<()> {
    let aliases = match &args.alias_table {
        Some(path) => AliasTable::from_json_file(path)?,
        None => AliasTable::builtin(),
    };
    let voter_number = args.voter_number.trim();

    let matches = find_voter(&args.batch_dir, voter_number, &aliases)?;
    if matches.is_empty() {
        warn!(voter_number = %voter_number, batch_dir = %args.batch_dir.display(), "voter not found in any batch file");
        return Ok(());
    }
    for found in &matches {
        info!(
            voter_number = %voter_number,
            file = %found.file,
            batch = found.batch_number,
            position = found.position,
            pk = %found.source_pk.map_or_else(|| "none".to_string(), |pk| pk.to_string()),
            "voter found"
        );
    }
    info!(occurrences = matches.len(), "search finished");
    Ok(())
}

/// Scans every batch file in order and reports each envelope whose mapped
/// voter number equals `voter_number`.
pub fn find_voter(
    batch_dir: &Path,
    voter_number: &str,
    aliases: &AliasTable<VoterField>,
) -> Result<Vec<VoterMatch>> {
    let mut matches = Vec::new();
    for file in list_batch_files(batch_dir)? {
        let source = open_json_batch(&file.path)?;
        for record in source.records.flatten() {
            if record.kind != RecordKind::Voter {
                continue;
            }
            if aliases.map(&record).get(VoterField::VoterNumber) == Some(voter_number) {
                matches.push(VoterMatch {
                    file: file.name.clone(),
                    batch_number: file.number,
                    position: record.location.position,
                    source_pk: record.source_pk,
                });
            }
        }
    }
    Ok(matches)
}
