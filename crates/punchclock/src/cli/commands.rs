//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::{Args, Subcommand, ValueEnum};

/// Worker management commands.
#[derive(Debug, Subcommand)]
pub enum WorkerCommand {
    /// Register a worker
    Add {
        /// Display name
        name: String,
    },

    /// List registered workers
    List {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },
}

/// Site management commands.
#[derive(Debug, Subcommand)]
pub enum SiteCommand {
    /// Register a site
    Add {
        /// Display name
        name: String,
    },

    /// List sites and their emergency state
    List {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },
}

/// Check-in command arguments.
#[derive(Debug, Args)]
pub struct CheckInCommand {
    /// Worker ID
    pub worker: i64,

    /// Site ID
    pub site: i64,
}

/// Check-out command arguments.
#[derive(Debug, Args)]
pub struct CheckOutCommand {
    /// Worker ID
    pub worker: i64,

    /// Site ID (defaults to the site the worker is checked in at)
    pub site: Option<i64>,
}

/// Emergency switch position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Switch {
    /// Declare an emergency
    On,
    /// Lift the emergency
    Off,
}

impl Switch {
    /// Whether the switch turns the emergency on.
    #[must_use]
    pub fn is_on(self) -> bool {
        matches!(self, Self::On)
    }
}

/// Emergency command arguments.
#[derive(Debug, Args)]
pub struct EmergencyCommand {
    /// Turn the emergency on or off
    #[arg(value_enum)]
    pub switch: Switch,

    /// Site ID
    #[arg(required_unless_present = "all")]
    pub site: Option<i64>,

    /// Apply to every site
    #[arg(long, conflicts_with = "site")]
    pub all: bool,
}

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Only show workers at this site
    #[arg(short, long)]
    pub site: Option<i64>,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// History command arguments.
#[derive(Debug, Args)]
pub struct HistoryCommand {
    /// Only events at this site
    #[arg(short, long)]
    pub site: Option<i64>,

    /// Only events for this worker
    #[arg(short, long)]
    pub worker: Option<i64>,

    /// Only events at or after this time (RFC 3339 or YYYY-MM-DD)
    #[arg(long, value_parser = parse_since)]
    pub since: Option<DateTime<Utc>>,

    /// Only events at or before this time (RFC 3339 or YYYY-MM-DD)
    #[arg(long, value_parser = parse_until)]
    pub until: Option<DateTime<Utc>>,

    /// Maximum number of events
    #[arg(short, long, default_value = "50")]
    pub limit: usize,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Audit command arguments.
#[derive(Debug, Args)]
pub struct AuditCommand {
    /// Rewrite divergent worker states from the ledger
    #[arg(long)]
    pub repair: bool,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Demo command arguments.
#[derive(Debug, Args)]
pub struct DemoCommand {
    /// Debounce window of the demo observer, in milliseconds
    #[arg(long, default_value = "100")]
    pub debounce_ms: u64,

    /// Print observer snapshots as JSON lines
    #[arg(short, long)]
    pub json: bool,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

/// Parse a lower time bound. A bare date means the start of that day (UTC).
///
/// # Errors
///
/// Returns a message if the input is neither RFC 3339 nor `YYYY-MM-DD`.
pub fn parse_since(input: &str) -> Result<DateTime<Utc>, String> {
    parse_bound(input, NaiveTime::MIN)
}

/// Parse an upper time bound. A bare date means the end of that day (UTC).
///
/// # Errors
///
/// Returns a message if the input is neither RFC 3339 nor `YYYY-MM-DD`.
pub fn parse_until(input: &str) -> Result<DateTime<Utc>, String> {
    let end_of_day = NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999)
        .ok_or_else(|| "invalid end of day".to_string())?;
    parse_bound(input, end_of_day)
}

fn parse_bound(input: &str, time_of_day: NaiveTime) -> Result<DateTime<Utc>, String> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(input) {
        return Ok(instant.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .map(|date| date.and_time(time_of_day).and_utc())
        .map_err(|_| format!("expected RFC 3339 or YYYY-MM-DD, got \"{input}\""))
}
