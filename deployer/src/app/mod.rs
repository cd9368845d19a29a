//! Application entry points: options, CLI parsing and the deploy run

pub mod cli;
pub mod options;
pub mod run;
