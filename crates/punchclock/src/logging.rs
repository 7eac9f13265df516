//! Log output for the `punch` binary and the observer.
//!
//! Logs go to stderr so `--json` output on stdout stays machine-readable.
//! `PUNCHCLOCK_LOG` (or `RUST_LOG`) replaces the filter picked from the
//! command-line verbosity.

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable read before `RUST_LOG`.
pub const LOG_ENV: &str = "PUNCHCLOCK_LOG";

/// How much the CLI logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    /// Errors only.
    Quiet,
    /// Attendance changes at info. Observer chatter is held to warnings.
    #[default]
    Normal,
    /// Debug, including every notification and refetch.
    Verbose,
    /// Everything.
    Trace,
}

impl Verbosity {
    /// The most detailed level shown for the attendance service.
    #[must_use]
    pub fn level(self) -> Level {
        match self {
            Self::Quiet => Level::ERROR,
            Self::Normal => Level::INFO,
            Self::Verbose => Level::DEBUG,
            Self::Trace => Level::TRACE,
        }
    }

    /// Filter directives for this verbosity.
    #[must_use]
    pub fn directives(self) -> String {
        match self {
            Self::Normal => format!("punchclock={},punchclock::sync=warn", self.level()),
            other => format!("punchclock={}", other.level()),
        }
    }
}

/// Install the stderr subscriber. Later calls are ignored.
///
/// ```no_run
/// use punchclock::{init_logging, logging::Verbosity};
///
/// init_logging(Verbosity::Verbose);
/// ```
pub fn init_logging(verbosity: Verbosity) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(verbosity.directives()));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_timer(fmt::time::uptime())
                .with_target(verbosity >= Verbosity::Verbose)
                .with_thread_ids(false),
        )
        .try_init();
}

#[cfg(test)]
pub(crate) fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels() {
        assert_eq!(Verbosity::Quiet.level(), Level::ERROR);
        assert_eq!(Verbosity::Normal.level(), Level::INFO);
        assert_eq!(Verbosity::Verbose.level(), Level::DEBUG);
        assert_eq!(Verbosity::Trace.level(), Level::TRACE);
    }

    #[test]
    fn test_normal_quiets_observer() {
        assert_eq!(
            Verbosity::Normal.directives(),
            "punchclock=INFO,punchclock::sync=warn"
        );
        assert_eq!(Verbosity::Verbose.directives(), "punchclock=DEBUG");
        for verbosity in [
            Verbosity::Quiet,
            Verbosity::Normal,
            Verbosity::Verbose,
            Verbosity::Trace,
        ] {
            assert!(verbosity.directives().parse::<EnvFilter>().is_ok());
        }
    }

    #[test]
    fn test_repeated_init_is_harmless() {
        init_logging(Verbosity::Quiet);
        init_logging(Verbosity::Trace);
        init_test_logging();
    }
}
