use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use wt_cli::commands::{debug, import, jobs, maintain, status, watch_time};
use wt_cli::{Cli, Commands, Config};

/// Load config and open database, ensuring the parent directory exists.
fn open_database(config_path: Option<&Path>) -> Result<(wt_db::Database, Config)> {
    let config = Config::load_from(config_path).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }

    let db = wt_db::Database::open_with_busy_timeout(&config.database_path, config.busy_timeout())
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;
    Ok((db, config))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // Use try_init to avoid panic if tracing is already initialized (e.g., in tests)
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    let stdout = io::stdout();
    let mut out = stdout.lock();

    match &cli.command {
        Some(Commands::Status) => {
            let (db, config) = open_database(cli.config.as_deref())?;
            status::run(&mut out, &db, &config)?;
        }
        Some(Commands::Import) => {
            let (mut db, _config) = open_database(cli.config.as_deref())?;
            import::run(&mut out, &mut db)?;
        }
        Some(Commands::WatchTime(args)) => {
            let (db, config) = open_database(cli.config.as_deref())?;
            watch_time::run(&mut out, &db, &config, args)?;
        }
        Some(Commands::Maintain(args)) => {
            let (mut db, config) = open_database(cli.config.as_deref())?;
            maintain::run(&mut out, &mut db, &config, args)?;
        }
        Some(Commands::Jobs(args)) => {
            let (db, _config) = open_database(cli.config.as_deref())?;
            jobs::run(&mut out, &db, args)?;
        }
        Some(Commands::Debug { action }) => {
            let (db, config) = open_database(cli.config.as_deref())?;
            debug::run(&mut out, &db, &config, action)?;
        }
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            writeln!(out)?;
        }
    }

    out.flush()?;
    Ok(())
}
