use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "voterload",
    version,
    about = "Bulk voter import, hierarchy linking and completeness auditing"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Import voter records from a spreadsheet, CSV, JSON batches or a legacy database.
    Import(ImportArgs),
    /// Import polling centers and their stations from a center list.
    ImportCenters(ImportCentersArgs),
    /// Resolve voter references to centers, stations and registration centers.
    Link(LinkArgs),
    /// Report which checkpointed batches are present in the store.
    Audit(AuditArgs),
    /// Build a checkpoint manifest from a directory of batch files.
    Checkpoints(CheckpointsArgs),
    /// Locate a voter number inside batch files.
    Find(FindArgs),
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ImportArgs {
    #[arg(long, default_value = ".cache/voterload")]
    pub work_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long, value_enum)]
    pub format: SourceFormat,

    /// File or directory to read.
    #[arg(long)]
    pub input: PathBuf,

    #[arg(long)]
    pub sheet: Option<String>,

    /// Data rows to skip after the header row.
    #[arg(long, default_value_t = 0)]
    pub skip_rows: usize,

    /// Legacy table name; detected when omitted.
    #[arg(long)]
    pub table: Option<String>,

    #[arg(long)]
    pub alias_table: Option<PathBuf>,

    #[arg(long, default_value_t = 5000)]
    pub batch_size: usize,

    #[arg(long, value_enum, default_value_t = UpsertPolicy::SkipExisting)]
    pub policy: UpsertPolicy,

    #[arg(long, value_enum)]
    pub empty_values: Option<EmptyValuePolicy>,

    #[arg(long, default_value_t = 0)]
    pub offset: u64,

    #[arg(long)]
    pub limit: Option<u64>,

    /// Exact-match predicate on a canonical field, e.g. `governorate=Basra`.
    #[arg(long = "filter")]
    pub filters: Vec<String>,

    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    #[arg(long)]
    pub start_batch: Option<u32>,

    #[arg(long)]
    pub end_batch: Option<u32>,

    /// Skip batch files whose checkpoint is already present in the store.
    #[arg(long, default_value_t = false)]
    pub skip_applied: bool,

    #[arg(long)]
    pub checkpoints: Option<PathBuf>,

    /// Seconds between heartbeat lines while a batch is in flight.
    #[arg(long, default_value_t = 30)]
    pub heartbeat_secs: u64,

    #[arg(long)]
    pub report_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ImportCentersArgs {
    #[arg(long, default_value = ".cache/voterload")]
    pub work_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = SourceFormat::Xlsx)]
    pub format: SourceFormat,

    #[arg(long)]
    pub input: PathBuf,

    #[arg(long)]
    pub sheet: Option<String>,

    /// Data rows to skip after the header row, such as a totals row.
    #[arg(long, default_value_t = 0)]
    pub skip_rows: usize,

    #[arg(long, value_enum, default_value_t = VotingType::General)]
    pub voting_type: VotingType,

    #[arg(long)]
    pub alias_table: Option<PathBuf>,

    #[arg(long)]
    pub default_governorate: Option<String>,

    #[arg(long)]
    pub report_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct LinkArgs {
    #[arg(long, default_value = ".cache/voterload")]
    pub work_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long, default_value_t = 1000)]
    pub batch_size: usize,

    /// Maximum voters to examine in this run.
    #[arg(long)]
    pub limit: Option<u64>,

    #[arg(long)]
    pub report_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct AuditArgs {
    #[arg(long, default_value = ".cache/voterload")]
    pub work_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Checkpoint manifest; defaults to `<work-root>/manifests/batch_checkpoints.json`.
    #[arg(long)]
    pub checkpoints: Option<PathBuf>,

    /// Directory holding the batch files, used to count missing records.
    #[arg(long)]
    pub batch_dir: Option<PathBuf>,

    #[arg(long)]
    pub expected_count: Option<u64>,

    #[arg(long, default_value_t = 10)]
    pub max_batches_per_round: usize,

    #[arg(long)]
    pub report_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct CheckpointsArgs {
    #[arg(long, default_value = ".cache/voterload")]
    pub work_root: PathBuf,

    #[arg(long)]
    pub batch_dir: PathBuf,

    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct FindArgs {
    #[arg(long)]
    pub batch_dir: PathBuf,

    #[arg(long)]
    pub voter_number: String,

    #[arg(long)]
    pub alias_table: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/voterload")]
    pub work_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub expected_count: Option<u64>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum SourceFormat {
    Xlsx,
    Csv,
    JsonBatch,
    JsonBatchDir,
    LegacySqlite,
}

impl SourceFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Xlsx => "xlsx",
            Self::Csv => "csv",
            Self::JsonBatch => "json-batch",
            Self::JsonBatchDir => "json-batch-dir",
            Self::LegacySqlite => "legacy-sqlite",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum UpsertPolicy {
    SkipExisting,
    UpdateExisting,
}

impl UpsertPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SkipExisting => "skip-existing",
            Self::UpdateExisting => "update-existing",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum EmptyValuePolicy {
    Overwrite,
    Preserve,
}

impl EmptyValuePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Overwrite => "overwrite",
            Self::Preserve => "preserve",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum VotingType {
    General,
    Special,
}

impl VotingType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Special => "special",
        }
    }
}
