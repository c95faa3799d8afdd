//! config-sync
//!
//! Command-line front end: inspects, compares and watches layered
//! configuration files without a host application.

use anyhow::{Result, bail};
use clap::Parser;
use config_sync::catalog::read_mnemonic_table;
use config_sync::cli::check::{CheckArgs, run_check};
use config_sync::cli::diff::{DiffArgs, diff_files};
use config_sync::cli::{Cli, Command};
use config_sync::logging::{LogLevel, LogLevelFilter, Logger, log_level_to_tracing};
use config_sync::sources::{FormatSet, WatcherConfig, watch_roots};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::sync::{Arc, mpsc};
use tracing_subscriber::FmtSubscriber;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on --log option
    let min_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let level = log_level_to_tracing(min_level);
    match cli.log.as_str() {
        "0" | "off" => {}
        "1" | "stdout" => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_writer(std::io::stdout)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        "2" | "stderr" => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        filename => {
            // Log to file (append mode)
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(filename)?;
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_writer(file)
                .with_ansi(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    let filter = Arc::new(LogLevelFilter::new(min_level));
    let logger = Logger::new()
        .with_level_filter(filter)
        .with_name("config_sync");

    let mnemonics: HashMap<String, String> = match &cli.mnemonics {
        Some(path) => read_mnemonic_table(path)?.into_iter().collect(),
        None => HashMap::new(),
    };
    let formats = FormatSet::all();

    match cli.command {
        Command::Check(args) => {
            if !check_once(&args, &formats, &mnemonics, &logger) {
                std::process::exit(1);
            }
        }
        Command::Diff(args) => run_diff(args, &formats)?,
        Command::Watch(args) => run_watch(args, formats, mnemonics, logger)?,
    }

    Ok(())
}

/// Print one check report. Returns false when any file failed.
fn check_once(
    args: &CheckArgs,
    formats: &FormatSet,
    mnemonics: &HashMap<String, String>,
    logger: &Logger,
) -> bool {
    let report = run_check(&args.paths, formats, mnemonics, &logger.child("check"));
    print!("{}", report.render(args.format));
    report.is_ok()
}

fn run_diff(args: DiffArgs, formats: &FormatSet) -> Result<()> {
    let diff = diff_files(&args.source, &args.target, formats)?;
    if diff.is_empty() {
        println!("No differences found.");
    } else {
        print!("{}", diff.render(args.format));
    }
    Ok(())
}

fn run_watch(
    args: CheckArgs,
    formats: FormatSet,
    mnemonics: HashMap<String, String>,
    logger: Logger,
) -> Result<()> {
    check_once(&args, &formats, &mnemonics, &logger);

    let (tx, rx) = mpsc::channel();
    let config = WatcherConfig {
        formats: formats.clone(),
        ..WatcherConfig::default()
    };
    let _watcher = watch_roots(&args.paths, config, logger.child("watcher"), move |changed| {
        let _ = tx.send(changed);
    })?;

    for changed in rx {
        for path in &changed {
            logger.info(&format!("Changed: {}", path.display()));
        }
        check_once(&args, &formats, &mnemonics, &logger);
    }
    bail!("file watcher stopped")
}
