use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use homedir::my_home;

mod cli;
mod config;
mod credibility;
mod document;
mod errors;
mod lock;
mod pool;
mod profile;
mod retrieval;
mod retry;
mod semantic;
mod service;
mod store;
#[cfg(test)]
mod tests;
mod versioning;
mod web;

use cli::Command;
use config::Config;
use service::ExpertService;

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_env("EXPERTDB_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    // also forwards `log` records
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn base_path(arg: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(path) = arg {
        return Ok(path);
    }
    if let Ok(path) = std::env::var("EXPERTDB_BASE_PATH") {
        return Ok(PathBuf::from(path));
    }
    let home = my_home()
        .context("could not determine home directory")?
        .context("home directory path is empty")?;
    Ok(home.join(".local/share/expertdb"))
}

fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();
    init_logging(args.verbose);

    let base = base_path(args.base_path)?;
    let config = Config::load_with(&base)?;
    let service = ExpertService::open(config)?;

    match args.command {
        Command::Daemon { addr } => web::start_daemon(Arc::new(service), &addr),
        Command::Ingest {
            file,
            format,
            version,
            source,
            message,
        } => cli::handle_ingest(&service, &file, format, version, source, message),
        Command::Search {
            query,
            initial_k,
            final_k,
            filter,
        } => cli::handle_search(&service, query, initial_k, final_k, filter),
        Command::Versions { max_entries } => cli::handle_versions(&service, max_entries),
        Command::Restore { commit_id } => cli::handle_restore(&service, &commit_id),
        Command::RefreshStats {} => cli::handle_refresh_stats(&service),
        Command::Count {} => cli::handle_count(&service),
        Command::Reset { yes } => cli::handle_reset(&service, yes),
        Command::Values { field } => cli::handle_values(&service, &field),
    }
}
