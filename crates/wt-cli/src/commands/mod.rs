//! CLI subcommand implementations.

pub mod debug;
pub mod import;
pub mod jobs;
pub mod maintain;
pub mod status;
pub mod util;
pub mod watch_time;
