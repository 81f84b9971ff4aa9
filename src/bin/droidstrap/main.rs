mod app;
mod commands;

use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::app::{Cli, Command};

/// Environment variable holding the log filter.
const LOG_ENV: &str = "DROIDSTRAP_LOG";

static CANCELLED: AtomicBool = AtomicBool::new(false);

pub(crate) fn cancelled() -> bool {
    CANCELLED.load(Ordering::Relaxed)
}

fn main() -> anyhow::Result<()> {
    ctrlc::set_handler(|| {
        if CANCELLED.swap(true, Ordering::Relaxed) {
            eprintln!("\nCancelled.");
            std::process::exit(130);
        }
    })?;

    let cli = Cli::parse();

    // info+ on stderr; --verbose enables debug; DROIDSTRAP_LOG overrides both
    let level = if cli.global.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    match &cli.command {
        Command::Run(options) => commands::run::run(options),
        Command::Symbols {
            library,
            names,
            search,
        } => commands::symbols::run(library, names, search),
        Command::Offsets { file, api_level } => {
            commands::offsets::run(file.as_deref(), api_level.as_deref())
        }
    }
}
