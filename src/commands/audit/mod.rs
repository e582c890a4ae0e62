mod ranges;
mod report;
mod run;
#[cfg(test)]
mod tests;

pub use ranges::{compress_ranges, plan_rounds};
pub use report::{
    AuditOptions, applied_batch_numbers, audit_checkpoints, default_checkpoints_path,
    load_checkpoints,
};
pub use run::run;
