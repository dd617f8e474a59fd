//! suite-conductor - distributed test-run orchestration
//!
//! A CLI around a fan-out/fan-in test orchestrator, its chord health
//! monitor, and a cross-instance invocation router for client-registered
//! capabilities.
//!
//! ## Features
//!
//! - One execution unit per test, collected by a single exactly-once callback
//! - Bounded retry, soft/hard time limits and panic containment per unit
//! - Tenant context carried through queue headers into every unit
//! - Monitor to find, revoke, inspect and purge stuck groups
//! - Connection registry mirrored to a shared store, with RPC forwarding
//! - Multiple output formats (Table, JSON, CSV)
//!
//! ## Usage
//!
//! ```bash
//! # Run a five-test suite with one failing test
//! suite-conductor run --tests 5 --fail test-3
//!
//! # Leave a group open, then find and revoke it
//! suite-conductor run --no-workers
//! suite-conductor monitor check --max-age 0
//! suite-conductor monitor revoke --max-age 0
//!
//! # Invoke a capability held by another instance
//! suite-conductor invoke --capability sum --inputs '{"values":[1,2,3]}'
//!
//! # Same call after the client disconnected: sdk_not_connected
//! suite-conductor invoke --disconnect-first
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

mod cli;
mod cluster;
mod config;
mod executor;
mod models;
mod monitor;
mod output;
mod queue;
mod registry;
mod router;
mod runs;
mod state;
mod store;
mod tenant;
mod utils;

use cli::{Args, Command, ConfigAction, MonitorAction};
use cluster::sim::{LoopbackConnection, ScriptedTarget};
use cluster::ServerInstance;
use config::{AppConfig, EnvConfig};
use executor::{ExecutionTask, Orchestrator, ResultCollector, RunRequest};
use models::RunStatus;
use monitor::{ChordMonitor, MonitorReport, EXIT_CANCELLED, EXIT_ERROR, EXIT_ISSUES, EXIT_OK};
use output::{OutputFormat, ResultFormatter};
use queue::ChordQueue;
use router::InvocationRequest;
use runs::{MemoryRunStore, RunStore};
use state::{ClusterState, StateStorage};
use store::MemoryStore;
use tenant::TenantContext;
use utils::logger::{init_logger, LogLevel};

/// Poll interval while waiting for a run to finish
const WAIT_POLL: Duration = Duration::from_millis(100);

/// Process-wide wiring shared by the commands
struct App {
    config: AppConfig,
    formatter: ResultFormatter,
    storage: StateStorage,
    store: Arc<MemoryStore>,
    runs: Arc<MemoryRunStore>,
}

impl App {
    async fn load(args: &Args, env: &EnvConfig) -> Result<Self> {
        let (config, source) = AppConfig::resolve(args.config.as_deref())?;
        match &source {
            Some(path) => debug!(path = %path.display(), "configuration loaded"),
            None => debug!("no configuration file, using defaults"),
        }

        let format = args
            .format
            .as_deref()
            .or(env.format.as_deref())
            .unwrap_or("table");
        let format = OutputFormat::from_str(format)
            .ok_or_else(|| anyhow::anyhow!("Unknown output format: {format}"))?;

        let state_file = args
            .state_file
            .clone()
            .or_else(|| env.state_file.as_deref().map(config::expand_path));
        let storage = match state_file {
            Some(path) => StateStorage::new(path),
            None => StateStorage::default_location()?,
        };

        let mut formatter = ResultFormatter::new(format);
        if !std::io::stdout().is_terminal() || std::env::var_os("NO_COLOR").is_some() {
            formatter = formatter.no_color();
        }

        let store = Arc::new(MemoryStore::new());
        let runs = Arc::new(MemoryRunStore::new());
        storage.load()?.install(&store, &runs).await?;

        Ok(Self {
            config,
            formatter,
            storage,
            store,
            runs,
        })
    }

    async fn persist(&self) -> Result<()> {
        let state = ClusterState::capture(&self.store, &self.runs).await?;
        self.storage.save(&state)
    }

    fn monitor(&self) -> ChordMonitor {
        ChordMonitor::new(
            self.store.clone(),
            self.runs.clone(),
            self.config.monitor.clone(),
        )
        .with_retention(self.config.workers.result_retention())
    }

    fn report<R: MonitorReport>(&self, report: &R) -> i32 {
        println!("{}", self.formatter.format_report(report));
        report.exit_code()
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let env = EnvConfig::load();

    let level = if args.verbose || env.verbose == Some(true) {
        LogLevel::Debug
    } else {
        args.log_level
    };
    init_logger(level);

    let code = match dispatch(args, &env).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            EXIT_ERROR
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(EXIT_ERROR as u8))
}

async fn dispatch(args: Args, env: &EnvConfig) -> Result<i32> {
    // config commands must work even when the effective configuration is invalid
    if let Command::Config(config_args) = &args.command {
        return manage_config(&config_args.action, args.config.as_deref());
    }

    let ctx = App::load(&args, env).await?;
    match args.command {
        Command::Run(run_args) => run_suite(&ctx, run_args).await,
        Command::Status(status_args) => show_status(&ctx, status_args).await,
        Command::Monitor(monitor_args) => run_monitor(&ctx, monitor_args.action).await,
        Command::Invoke(invoke_args) => invoke(&ctx, invoke_args).await,
        Command::Config(_) => Ok(EXIT_OK),
    }
}

async fn run_suite(ctx: &App, args: cli::RunArgs) -> Result<i32> {
    let mut target = ScriptedTarget::new(Duration::from_millis(args.latency_ms))
        .failing(args.fail.iter().cloned())
        .broken(args.broken.iter().cloned());
    for test_id in &args.flaky {
        target = target.flaky(test_id.clone(), 1);
    }

    let handler = Arc::new(ExecutionTask::new(
        Arc::new(target),
        ctx.config.retry.clone(),
        ctx.config.workers.soft_time_limit(),
    ));
    let callback = Arc::new(ResultCollector::new(ctx.runs.clone()));
    let mut queue_config = ctx.config.workers.queue_config();
    if args.no_workers {
        queue_config.concurrency = 0;
    }
    let queue = ChordQueue::new(ctx.store.clone(), handler, callback, queue_config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = queue.start_revoke_listener(shutdown_rx).await?;
    let orchestrator = Orchestrator::new(queue, ctx.runs.clone());

    let request = RunRequest {
        test_configuration_id: args.suite.clone(),
        target_id: args.target.clone(),
        test_ids: (1..=args.tests).map(|i| format!("test-{i}")).collect(),
        tenant: Some(TenantContext::new(&args.org, &args.user)),
    };
    let run_id = orchestrator.trigger(request, None).await?;

    let code = if args.no_workers {
        println!("Run {run_id} enqueued without workers; its group stays open");
        EXIT_OK
    } else {
        info!(run_id, tests = args.tests, "waiting for run to finish");
        wait_for_run(ctx, &orchestrator, &run_id).await?
    };

    let _ = shutdown_tx.send(true);
    let _ = listener.await;
    ctx.persist().await?;
    Ok(code)
}

async fn wait_for_run(ctx: &App, orchestrator: &Orchestrator, run_id: &str) -> Result<i32> {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Cancelled; run {run_id} left in progress");
                return Ok(EXIT_CANCELLED);
            }
            _ = tokio::time::sleep(WAIT_POLL) => {}
        }

        let view = orchestrator
            .status(run_id)
            .await?
            .with_context(|| format!("Run {run_id} disappeared"))?;
        if view.status.is_terminal() {
            println!("{}", ctx.formatter.format_run(&view));
            return Ok(if view.status == RunStatus::Completed {
                EXIT_OK
            } else {
                EXIT_ISSUES
            });
        }
    }
}

async fn show_status(ctx: &App, args: cli::StatusArgs) -> Result<i32> {
    let Some(run_id) = args.run_id else {
        let runs = ctx.runs.list_runs().await?;
        if runs.is_empty() {
            println!("No runs recorded in {}", ctx.storage.path().display());
        }
        let summary = ResultFormatter::new(OutputFormat::Summary);
        for run in &runs {
            println!("{}", summary.format_run(&run.status_view()));
        }
        return Ok(EXIT_OK);
    };

    let run = ctx
        .runs
        .get_run(&run_id)
        .await?
        .with_context(|| format!("Unknown run: {run_id}"))?;
    println!("{}", ctx.formatter.format_run(&run.status_view()));

    if let Some(path) = args.export {
        let file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        state::export_results_csv(&run.id, &run.results, file)?;
        println!("Results exported to {}", path.display());
    }

    Ok(match run.status {
        RunStatus::Completed | RunStatus::Pending | RunStatus::InProgress => EXIT_OK,
        RunStatus::PartiallyFailed | RunStatus::Failed => EXIT_ISSUES,
    })
}

async fn run_monitor(ctx: &App, action: MonitorAction) -> Result<i32> {
    let monitor = ctx.monitor();
    let code = match action {
        MonitorAction::Status => ctx.report(&monitor.status().await?),
        MonitorAction::Check { max_age } => ctx.report(&monitor.check(max_age).await?),
        MonitorAction::Revoke { max_age, dry_run } => {
            let code = ctx.report(&monitor.revoke(max_age, dry_run).await?);
            if !dry_run {
                ctx.persist().await?;
            }
            code
        }
        MonitorAction::Inspect { group_id, full } => {
            ctx.report(&monitor.inspect(&group_id, full).await?)
        }
        MonitorAction::Clean { force } => {
            let code = ctx.report(&monitor.clean(force).await?);
            if force {
                ctx.persist().await?;
            }
            code
        }
    };
    Ok(code)
}

async fn invoke(ctx: &App, args: cli::InvokeArgs) -> Result<i32> {
    let inputs: serde_json::Value =
        serde_json::from_str(&args.inputs).context("--inputs must be valid JSON")?;

    // connections are live objects, so the demo cluster never touches the state file
    let store = Arc::new(MemoryStore::new());
    let owner = ServerInstance::start(
        "instance-a",
        store.clone(),
        ctx.config.registry.clone(),
        ctx.config.router.clone(),
    )
    .await;
    let caller = ServerInstance::start(
        "instance-b",
        store,
        ctx.config.registry.clone(),
        ctx.config.router.clone(),
    )
    .await;

    if !args.disconnected {
        owner
            .connect(&args.subject, &args.environment, Arc::new(LoopbackConnection))
            .await;
    }
    if args.disconnect_first {
        let released = owner.disconnect(&args.subject, &args.environment).await;
        debug!(released, "client disconnected before invoking");
    }
    info!(
        subject = %args.subject,
        environment = %args.environment,
        connected = caller.is_connected(&args.subject, &args.environment).await,
        "invoking from {}",
        caller.instance_id()
    );

    let result = caller
        .invoke(InvocationRequest {
            subject: args.subject,
            environment: args.environment,
            capability_name: args.capability,
            inputs,
        })
        .await;
    println!("{}", ctx.formatter.format_invocation(&result));

    caller.shutdown().await;
    owner.shutdown().await;
    Ok(if result.is_success() {
        EXIT_OK
    } else {
        EXIT_ISSUES
    })
}

fn manage_config(action: &ConfigAction, explicit: Option<&std::path::Path>) -> Result<i32> {
    match action {
        ConfigAction::Init { output, force } => {
            if output.exists() && !force {
                anyhow::bail!(
                    "{} already exists; pass --force to overwrite",
                    output.display()
                );
            }
            AppConfig::default().save(output)?;
            println!("✓ Configuration written to {}", output.display());
        }
        ConfigAction::Show => {
            let (config, source) = AppConfig::resolve(explicit)?;
            match source {
                Some(path) => println!("# source: {}", path.display()),
                None => println!(
                    "# source: defaults (searched {})",
                    config::CONFIG_LOCATIONS.join(", ")
                ),
            }
            if EnvConfig::load().has_any() {
                println!("# SUITE_CONDUCTOR_* environment overrides applied");
            }
            print!(
                "{}",
                serde_yaml::to_string(&config).context("Failed to serialize config")?
            );
        }
        ConfigAction::Validate { path } => {
            match path {
                Some(path) => {
                    AppConfig::load(path)?;
                    println!("✓ {} is valid", path.display());
                }
                None => {
                    AppConfig::resolve(explicit)?;
                    println!("✓ Effective configuration is valid");
                }
            }
        }
        ConfigAction::Env => {
            config::print_env_help();
            println!();
            EnvConfig::load().print_summary();
        }
    }
    Ok(EXIT_OK)
}
