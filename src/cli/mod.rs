//! CLI command definitions for config-sync
//!
//! This module defines the CLI structure using clap's derive macros.
//! The main entry point is the `Cli` struct which contains subcommands.

pub mod check;
pub mod diff;

use check::CheckArgs;
use clap::{Parser, Subcommand};
use diff::DiffArgs;
use std::path::PathBuf;

/// Inspect and watch layered configuration files
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2", global = true)]
    pub log: String,

    /// Mnemonic table (`alias=type.name` lines) applied to top-level names
    #[arg(long, value_name = "FILE", global = true)]
    pub mnemonics: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Parse every configuration file under the given roots and print the
    /// merged tree per name
    Check(CheckArgs),

    /// Compare two configuration files
    Diff(DiffArgs),

    /// Re-run check every time a file under the roots changes
    Watch(CheckArgs),
}
