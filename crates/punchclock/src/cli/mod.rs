//! Command-line interface for punchclock.
//!
//! This module provides the CLI structure for the `punch` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{
    parse_since, parse_until, AuditCommand, CheckInCommand, CheckOutCommand, ConfigCommand,
    DemoCommand, EmergencyCommand, HistoryCommand, SiteCommand, StatusCommand, Switch,
    WorkerCommand,
};

/// punch - Site attendance from the terminal
///
/// Records worker check-ins and check-outs, shows who is on site, and
/// manages site emergencies.
#[derive(Debug, Parser)]
#[command(name = "punch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage workers
    #[command(subcommand)]
    Worker(WorkerCommand),

    /// Manage sites
    #[command(subcommand)]
    Site(SiteCommand),

    /// Check a worker in at a site
    CheckIn(CheckInCommand),

    /// Check a worker out
    CheckOut(CheckOutCommand),

    /// Declare or lift a site emergency
    Emergency(EmergencyCommand),

    /// Show who is checked in where
    Status(StatusCommand),

    /// Show the check-in ledger
    History(HistoryCommand),

    /// Compare worker states against a replay of the ledger
    Audit(AuditCommand),

    /// Run a scripted scenario against an in-memory database with a live observer
    Demo(DemoCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> crate::logging::Verbosity {
        if self.quiet {
            crate::logging::Verbosity::Quiet
        } else {
            match self.verbose {
                0 => crate::logging::Verbosity::Normal,
                1 => crate::logging::Verbosity::Verbose,
                _ => crate::logging::Verbosity::Trace,
            }
        }
    }
}
