pub mod audit;
pub mod centers;
pub mod checkpoints;
pub mod find;
pub mod import;
pub mod link;
pub mod status;
