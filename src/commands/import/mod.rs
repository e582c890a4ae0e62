mod pipeline;
mod progress;
mod run;
#[cfg(test)]
mod tests;

pub use run::run;
