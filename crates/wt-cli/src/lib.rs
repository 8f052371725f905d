//! Watch-time ledger CLI library.
//!
//! This crate provides the `wt` command-line interface.

mod cli;
pub mod commands;
mod config;

pub use cli::{Cli, Commands};
pub use config::{AggregationSettings, Config};
