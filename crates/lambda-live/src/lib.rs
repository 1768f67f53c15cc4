pub mod cli;
pub mod commands;

pub use lambda_live_core::{bus, config, context, runtime, utils, workers};
