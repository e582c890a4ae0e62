use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Result, bail};
use tracing::{info, warn};

use crate::cli::CheckpointsArgs;
use crate::commands::audit::default_checkpoints_path;
use crate::sources::{BatchFile, list_batch_files, open_json_batch};
use crate::util::write_json_pretty;

pub fn run(args: CheckpointsArgs) -> Result<()> {
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| default_checkpoints_path(&args.work_root));

    let checkpoints = build_checkpoints(&args.batch_dir)?;
    if checkpoints.is_empty() {
        bail!("no batch file in {} carries a primary key", args.batch_dir.display());
    }
    write_json_pretty(&output, &checkpoints)?;
    info!(
        batch_dir = %args.batch_dir.display(),
        batches = checkpoints.len(),
        path = %output.display(),
        "checkpoint manifest written"
    );
    Ok(())
}

/// Maps each batch file's stem to the primary key of its last envelope.
pub fn build_checkpoints(batch_dir: &Path) -> Result<BTreeMap<String, i64>> {
    let mut checkpoints = BTreeMap::new();
    for file in list_batch_files(batch_dir)? {
        match last_primary_key(&file)? {
            Some(pk) => {
                checkpoints.insert(batch_id(&file), pk);
            }
            None => warn!(file = %file.name, "batch file has no envelope with a primary key"),
        }
    }
    Ok(checkpoints)
}

fn last_primary_key(file: &BatchFile) -> Result<Option<i64>> {
    let source = open_json_batch(&file.path)?;
    Ok(source
        .records
        .filter_map(|record| record.ok().and_then(|raw| raw.source_pk))
        .last())
}

fn batch_id(file: &BatchFile) -> String {
    Path::new(&file.name)
        .file_stem()
        .map_or_else(|| file.name.clone(), |stem| stem.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::commands::audit::load_checkpoints;

    #[test]
    fn build_checkpoints_records_last_primary_key_per_file() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        fs::write(
            dir.path().join("voters_batch_001.json"),
            r#"[{"model": "elections.voter", "pk": 11, "fields": {}},
                {"model": "elections.voter", "pk": 12, "fields": {}}]"#,
        )
        .expect("batch should write");
        fs::write(
            dir.path().join("voters_batch_002.jsonl"),
            "{\"model\": \"elections.voter\", \"pk\": 21, \"fields\": {}}\n\
             {\"model\": \"elections.voter\", \"pk\": \"22\", \"fields\": {}}\n",
        )
        .expect("batch should write");
        fs::write(dir.path().join("voters_batch_003.json"), "[]").expect("batch should write");

        let checkpoints = build_checkpoints(dir.path()).expect("checkpoints should build");
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(checkpoints.get("voters_batch_001"), Some(&12));
        assert_eq!(checkpoints.get("voters_batch_002"), Some(&22));

        let path = dir.path().join("manifests").join("batch_checkpoints.json");
        write_json_pretty(&path, &checkpoints).expect("manifest should write");
        let loaded = load_checkpoints(&path).expect("manifest should load");
        assert_eq!(loaded[1].batch_number, Some(2));
        assert_eq!(loaded[1].last_pk, 22);
    }
}
