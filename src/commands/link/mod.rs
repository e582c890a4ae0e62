mod linker;
mod run;

pub use linker::{LinkOptions, count_unresolved, link_hierarchy};
pub use run::run;
