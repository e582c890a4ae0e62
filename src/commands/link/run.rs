use anyhow::Result;
use chrono::Utc;
use tracing::info;

use super::linker::{LinkOptions, count_unresolved, link_hierarchy};
use crate::cli::LinkArgs;
use crate::model::LinkRunManifest;
use crate::store::{DB_SCHEMA_VERSION, open_store};
use crate::util::{now_utc_string, utc_compact_string, write_json_pretty};

pub fn run(args: LinkArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("link-{}", utc_compact_string(started_ts));
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| args.work_root.join("voters.sqlite"));

    let mut connection = open_store(&db_path)?;
    let working_set_before = count_unresolved(&connection)?;
    info!(
        run_id = %run_id,
        db = %db_path.display(),
        working_set = working_set_before,
        "hierarchy link started"
    );

    let options = LinkOptions {
        page_size: args.batch_size,
        limit: args.limit,
    };
    let stats = link_hierarchy(&mut connection, &options)?;
    let working_set_after = count_unresolved(&connection)?;

    let manifest = LinkRunManifest {
        manifest_version: 1,
        run_id,
        db_schema_version: DB_SCHEMA_VERSION.to_string(),
        started_at,
        updated_at: now_utc_string(),
        batch_size: options.page_size,
        limit: options.limit,
        working_set_before,
        working_set_after,
        stats,
    };
    let report_path = args.report_path.clone().unwrap_or_else(|| {
        args.work_root
            .join("manifests")
            .join(format!("link_run_{}.json", utc_compact_string(started_ts)))
    });
    write_json_pretty(&report_path, &manifest)?;

    info!(
        working_set_before,
        working_set_after,
        voters_linked = manifest.stats.voters_linked,
        report = %report_path.display(),
        "link report written"
    );
    Ok(())
}
