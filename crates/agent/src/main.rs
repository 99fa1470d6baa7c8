//! Usage Agent - per-host workload usage telemetry
//!
//! This binary runs on every application host, sampling CPU and memory
//! accounting for the workloads placed there and streaming the samples to
//! the central collector.

use agent_lib::{
    api,
    collector::{CgroupUsageReader, ClockTicks, CollectionSchedulerBuilder, WorkloadLocator},
    health::{components, HealthRegistry},
    lifecycle::{spawn_signal_listener, LifecycleCoordinator, ShutdownOutcome},
    observability::{AgentMetrics, StructuredLogger},
    registry::FileRegistry,
    sync::ReportingPipeline,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Per-host workload usage agent
#[derive(Parser)]
#[command(name = "usage-agent")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent in the foreground
    Run {
        /// Configuration file, overlaid with AGENT_* environment variables
        #[arg(long, short, env = "USAGE_AGENT_CONFIG")]
        config: Option<PathBuf>,

        /// Log output format
        #[arg(long, value_enum, default_value_t = LogFormat::Json)]
        log_format: LogFormat,
    },

    /// Send a control signal to a running agent
    Signal {
        /// Action to request
        #[arg(value_enum)]
        action: SignalAction,

        /// Process id of the running agent
        #[arg(long)]
        pid: i32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SignalAction {
    /// Finish in-flight collection, then exit (SIGQUIT)
    Quit,
    /// Exit immediately (SIGTERM)
    Stop,
    /// Re-read the configuration (SIGHUP)
    Reload,
}

impl SignalAction {
    fn signal(self) -> Signal {
        match self {
            SignalAction::Quit => Signal::SIGQUIT,
            SignalAction::Stop => Signal::SIGTERM,
            SignalAction::Reload => Signal::SIGHUP,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, log_format } => {
            init_tracing(log_format);
            run(config).await
        }
        Commands::Signal { action, pid } => {
            kill(Pid::from_raw(pid), action.signal())
                .with_context(|| format!("failed to signal process {}", pid))?;
            println!("Sent {} to {}", action.signal(), pid);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer()).init(),
    }
}

async fn run(config_path: Option<PathBuf>) -> Result<()> {
    // Configuration and clock tick errors are the only fatal ones
    let config = config::AgentConfig::load(config_path.as_deref())
        .context("invalid configuration")?;
    let clock_ticks = ClockTicks::from_system().context("cannot resolve clock tick rate")?;

    let health_registry = HealthRegistry::new();
    health_registry.register(components::SCHEDULER).await;
    health_registry.register(components::REPORTER).await;
    health_registry.register(components::REGISTRY).await;

    let metrics = AgentMetrics::new();

    let registry = Arc::new(FileRegistry::new(&config.registry_path));
    let locator = match &config.hostname {
        Some(hostname) => WorkloadLocator::with_hostname(registry, hostname.clone()),
        None => WorkloadLocator::new(registry),
    }
    .with_health(health_registry.clone());

    // Startup logging only; the locator resolves placement on its own
    let host = match locator.hostname() {
        Ok(name) => name.to_string(),
        Err(e) => {
            warn!(error = %e, "Cannot resolve hostname yet");
            "unknown".to_string()
        }
    };
    let logger = StructuredLogger::new(&host);
    logger.log_startup(
        AGENT_VERSION,
        &config.collector_addr,
        config.collection_interval_secs,
    );

    let reader = Arc::new(CgroupUsageReader::new(
        &config.cpuacct_root,
        &config.memory_root,
        clock_ticks,
    ));
    info!(
        cpuacct_root = %config.cpuacct_root.display(),
        memory_root = %config.memory_root.display(),
        clock_ticks = clock_ticks.per_second(),
        "Reading cgroup v1 accounting"
    );

    let (reporter, pipeline_task) =
        ReportingPipeline::start(config.client_config(), Some(health_registry.clone())).await;

    let (scheduler, scheduler_handle) = CollectionSchedulerBuilder::new()
        .locator(locator)
        .source(reader)
        .reporter(reporter.clone())
        .interval(config.collection_interval())
        .health(health_registry.clone())
        .build()?;

    if config.api_port != 0 {
        let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
        let port = config.api_port;
        tokio::spawn(async move {
            if let Err(e) = api::serve(port, app_state).await {
                error!(error = %e, "API server failed");
            }
        });
    }

    let signals = spawn_signal_listener().context("failed to install signal handlers")?;
    let coordinator = LifecycleCoordinator::new(scheduler_handle, reporter, logger)
        .with_reload_hook(config::reload_hook(config_path, config.clone()))
        .with_health(health_registry);

    let scheduler_task = tokio::spawn(scheduler.run());
    let outcome = coordinator.run(signals).await;

    if outcome == ShutdownOutcome::Drained {
        let _ = scheduler_task.await;
        let _ = pipeline_task.await;
    }
    info!(outcome = ?outcome, "Shutdown complete");

    Ok(())
}
