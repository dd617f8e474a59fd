//! CLI argument parsing
//!
//! Defines command-line interface using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::utils::logger::LogLevel;

/// Distributed test-run orchestrator
#[derive(Parser, Debug)]
#[command(name = "suite-conductor")]
#[command(author = "hephaex@gmail.com")]
#[command(version)]
#[command(about = "Fan out test runs, collect results once, and route client invocations")]
#[command(long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log level
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Cluster state file shared between invocations
    #[arg(long, global = true)]
    pub state_file: Option<PathBuf>,

    /// Output format (table, json, json-pretty, csv, summary)
    #[arg(long, global = true)]
    pub format: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Trigger a test run and wait for its result
    Run(RunArgs),

    /// Show run status
    Status(StatusArgs),

    /// Inspect and repair fan-in groups
    Monitor(MonitorArgs),

    /// Invoke a client capability across two server instances
    Invoke(InvokeArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

/// Arguments for run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Number of tests in the suite
    #[arg(short, long, default_value = "5")]
    pub tests: usize,

    /// Test ids that always fail (comma-separated, e.g. test-2,test-4)
    #[arg(long, value_delimiter = ',')]
    pub fail: Vec<String>,

    /// Test ids that fail immediately without retry
    #[arg(long, value_delimiter = ',')]
    pub broken: Vec<String>,

    /// Test ids that fail once and then pass
    #[arg(long, value_delimiter = ',')]
    pub flaky: Vec<String>,

    /// Simulated latency per test attempt in milliseconds
    #[arg(long, default_value = "50")]
    pub latency_ms: u64,

    /// Enqueue the run without starting workers, leaving its group open
    #[arg(long)]
    pub no_workers: bool,

    /// Test configuration id
    #[arg(long, default_value = "default-suite")]
    pub suite: String,

    /// Target under test
    #[arg(long, default_value = "local-target")]
    pub target: String,

    /// Organization owning the run
    #[arg(long, default_value = "local-org")]
    pub org: String,

    /// User triggering the run
    #[arg(long, default_value = "cli")]
    pub user: String,
}

/// Arguments for status command
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Run id; lists every run when omitted
    pub run_id: Option<String>,

    /// Write per-test results of the run to a CSV file
    #[arg(short, long)]
    pub export: Option<PathBuf>,
}

/// Arguments for monitor command
#[derive(Parser, Debug)]
pub struct MonitorArgs {
    #[command(subcommand)]
    pub action: MonitorAction,
}

#[derive(Subcommand, Debug)]
pub enum MonitorAction {
    /// Counts of open, closed and stuck groups
    Status,

    /// List groups open longer than the given age
    Check {
        /// Maximum age in hours
        #[arg(long, default_value = "2")]
        max_age: f64,
    },

    /// Force stuck groups closed and fail their runs
    Revoke {
        /// Maximum age in hours
        #[arg(long, default_value = "2")]
        max_age: f64,

        /// Report what would be revoked without changing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Show one group and its members
    Inspect {
        /// Group id
        group_id: String,

        /// Include stored member results
        #[arg(long)]
        full: bool,
    },

    /// Purge every group and its keys
    Clean {
        /// Required to actually purge
        #[arg(long)]
        force: bool,
    },
}

/// Arguments for invoke command
#[derive(Parser, Debug)]
pub struct InvokeArgs {
    /// Connection subject (project)
    #[arg(long, default_value = "proj1")]
    pub subject: String,

    /// Connection environment
    #[arg(long, default_value = "staging")]
    pub environment: String,

    /// Capability to invoke (echo, sum, sleep)
    #[arg(long, default_value = "sum")]
    pub capability: String,

    /// JSON inputs
    #[arg(long, default_value = r#"{"values":[1,2,3]}"#)]
    pub inputs: String,

    /// Do not connect any client before invoking
    #[arg(long)]
    pub disconnected: bool,

    /// Connect the client, then disconnect it gracefully before invoking
    #[arg(long, conflicts_with = "disconnected")]
    pub disconnect_first: bool,
}

/// Arguments for config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Write a default configuration file
    Init {
        /// Output path
        #[arg(short, long, default_value = "suite-conductor.yaml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Show,

    /// Validate a configuration file
    Validate {
        /// File to validate; the effective configuration when omitted
        path: Option<PathBuf>,
    },

    /// List supported environment variables and their current values
    Env,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_run_with_failures() {
        let args = Args::parse_from([
            "suite-conductor",
            "run",
            "--tests",
            "3",
            "--fail",
            "test-1,test-3",
            "--broken",
            "test-2",
            "--no-workers",
        ]);
        match args.command {
            Command::Run(run) => {
                assert_eq!(run.tests, 3);
                assert_eq!(run.fail, vec!["test-1", "test-3"]);
                assert_eq!(run.broken, vec!["test-2"]);
                assert!(run.no_workers);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_invoke_disconnect_flags_conflict() {
        let args = Args::parse_from(["suite-conductor", "invoke", "--disconnect-first"]);
        match args.command {
            Command::Invoke(invoke) => {
                assert!(invoke.disconnect_first);
                assert!(!invoke.disconnected);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Args::try_parse_from([
            "suite-conductor",
            "invoke",
            "--disconnected",
            "--disconnect-first"
        ])
        .is_err());
    }

    #[test]
    fn test_parse_monitor_revoke_with_global_flags() {
        let args = Args::parse_from([
            "suite-conductor",
            "monitor",
            "revoke",
            "--max-age",
            "0.5",
            "--dry-run",
            "--format",
            "json",
        ]);
        assert_eq!(args.format.as_deref(), Some("json"));
        match args.command {
            Command::Monitor(MonitorArgs {
                action: MonitorAction::Revoke { max_age, dry_run },
            }) => {
                assert_eq!(max_age, 0.5);
                assert!(dry_run);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
