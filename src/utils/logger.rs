//! Tracing subscriber setup
//!
//! Events go to stderr so table, JSON and CSV output on stdout stays
//! machine-readable. `SUITE_CONDUCTOR_LOG` takes a full filter directive and
//! wins over the level chosen on the command line.

use clap::ValueEnum;
use std::io::IsTerminal;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Environment variable holding a full filter directive
pub const LOG_ENV: &str = "SUITE_CONDUCTOR_LOG";

/// Verbosity of this crate's own events
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    #[value(alias = "warning")]
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

/// Dependencies stay at `warn`; only our own events follow `level`
fn directive(level: LogLevel) -> String {
    format!("warn,suite_conductor={}", LevelFilter::from(level))
}

fn build_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(directive(level)))
}

/// Install the global subscriber; a second call is a no-op
pub fn init_logger(level: LogLevel) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(build_filter(level))
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false)
        .compact()
        .try_init();
}
