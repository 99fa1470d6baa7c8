//! Collection scheduler
//!
//! Drives periodic sampling: on every tick the scheduler enumerates the
//! local workloads and fans out one dispatch task per workload and metric
//! kind. Dispatch tasks read the sample, seal it into an envelope and hand
//! it to the reporting pipeline.
//!
//! The scheduler owns its run state. Other tasks steer it only through a
//! [`SchedulerHandle`], which sends commands and observes the published
//! [`SchedulerState`].

use super::{cpu_percent, UsageError, UsageSource, WorkloadLocator};
use crate::health::{components, HealthRegistry};
use crate::models::{CpuUsageSample, MetricKind, UsageSample, Workload};
use crate::observability::AgentMetrics;
use crate::sync::{Envelope, ReporterHandle};
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Configuration for the collection scheduler
#[derive(Debug, Clone)]
pub struct CollectionConfig {
    /// Time between ticks (default: 10 seconds)
    pub interval: Duration,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
        }
    }
}

/// Lifecycle of the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Built, timer not yet started
    Idle,
    Running,
    /// No new ticks; waiting for in-flight dispatches
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy)]
enum SchedulerCommand {
    Drain,
    Stop,
}

/// Control surface of a running scheduler
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<SchedulerCommand>,
    state: watch::Receiver<SchedulerState>,
}

impl SchedulerHandle {
    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Stop ticking and let in-flight dispatches finish
    ///
    /// Returns false if the scheduler is already gone.
    pub async fn drain(&self) -> bool {
        self.commands.send(SchedulerCommand::Drain).await.is_ok()
    }

    /// Stop immediately, abandoning in-flight dispatches
    pub async fn stop(&self) -> bool {
        self.commands.send(SchedulerCommand::Stop).await.is_ok()
    }

    /// Wait until the scheduler reaches `Running` (or has already passed it)
    pub async fn wait_running(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s != SchedulerState::Idle).await;
    }

    /// Wait until the scheduler has stopped
    ///
    /// Also returns if the scheduler task went away without publishing
    /// `Stopped`.
    pub async fn wait_stopped(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == SchedulerState::Stopped).await;
    }
}

/// Previous CPU totals per workload, for utilisation between ticks
#[derive(Debug, Default)]
pub struct CpuPercentCache {
    previous_total_ns: HashMap<String, u64>,
}

impl CpuPercentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample, returning utilisation since the previous one
    pub fn observe(&mut self, sample: &CpuUsageSample) -> Option<f64> {
        let previous = self
            .previous_total_ns
            .insert(sample.workload_id.clone(), sample.total_usage_ns)?;
        cpu_percent(previous, sample)
    }

    /// Drop entries for workloads that are no longer local
    pub fn retain_local(&mut self, local: &[Workload]) -> Vec<String> {
        let local: HashSet<&str> = local.iter().map(|w| w.id.as_str()).collect();
        let departed: Vec<String> = self
            .previous_total_ns
            .keys()
            .filter(|id| !local.contains(id.as_str()))
            .cloned()
            .collect();

        for id in &departed {
            self.previous_total_ns.remove(id);
        }
        departed
    }

    pub fn contains(&self, workload_id: &str) -> bool {
        self.previous_total_ns.contains_key(workload_id)
    }

    pub fn len(&self) -> usize {
        self.previous_total_ns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.previous_total_ns.is_empty()
    }
}

/// What a finished dispatch task reports back to the scheduler
#[derive(Debug)]
enum DispatchOutcome {
    Cpu(CpuUsageSample),
    Memory,
    Skipped,
}

/// Shared, read-only context handed to every dispatch task
struct DispatchContext {
    source: Arc<dyn UsageSource>,
    reporter: ReporterHandle,
    metrics: AgentMetrics,
}

/// Periodic sampler across all local workloads
pub struct CollectionScheduler {
    locator: WorkloadLocator,
    context: Arc<DispatchContext>,
    config: CollectionConfig,
    health: Option<HealthRegistry>,
    commands: mpsc::Receiver<SchedulerCommand>,
    state: watch::Sender<SchedulerState>,
    /// Outstanding dispatch tasks from every tick not yet reaped
    tasks: JoinSet<DispatchOutcome>,
    cpu_cache: CpuPercentCache,
    tick_count: u64,
}

impl CollectionScheduler {
    pub fn new(
        locator: WorkloadLocator,
        source: Arc<dyn UsageSource>,
        reporter: ReporterHandle,
        config: CollectionConfig,
    ) -> (Self, SchedulerHandle) {
        let (command_tx, commands) = mpsc::channel(4);
        let (state, state_rx) = watch::channel(SchedulerState::Idle);

        let scheduler = Self {
            locator,
            context: Arc::new(DispatchContext {
                source,
                reporter,
                metrics: AgentMetrics::new(),
            }),
            config,
            health: None,
            commands,
            state,
            tasks: JoinSet::new(),
            cpu_cache: CpuPercentCache::new(),
            tick_count: 0,
        };

        let handle = SchedulerHandle {
            commands: command_tx,
            state: state_rx,
        };

        (scheduler, handle)
    }

    /// Run until drained or stopped
    pub async fn run(mut self) {
        info!(
            interval_secs = self.config.interval.as_secs_f64(),
            "Starting collection scheduler"
        );
        self.set_state(SchedulerState::Running);
        if let Some(health) = &self.health {
            health.set_healthy(components::SCHEDULER).await;
        }

        let period = self.config.interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let graceful = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                Some(result) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.reap(result);
                }
                command = self.commands.recv() => {
                    match command {
                        Some(SchedulerCommand::Drain) | None => break true,
                        Some(SchedulerCommand::Stop) => break false,
                    }
                }
            }
        };

        if graceful {
            self.drain().await;
        } else {
            self.abandon();
        }

        self.set_state(SchedulerState::Stopped);
        info!(ticks = self.tick_count, "Collection scheduler stopped");
    }

    fn set_state(&self, state: SchedulerState) {
        debug!(state = ?state, "Scheduler state change");
        self.state.send_replace(state);
    }

    /// Enumerate local workloads and fan out their dispatch tasks
    async fn tick(&mut self) {
        let start = Instant::now();
        let located = self.locator.try_local_workloads().await;
        self.tick_count += 1;

        self.context.metrics.observe_tick(
            start.elapsed().as_secs_f64(),
            located.as_ref().map(Vec::len),
        );

        // Placement unknown this cycle, so keep every cached total
        let Some(workloads) = located else {
            return;
        };

        for departed in self.cpu_cache.retain_local(&workloads) {
            debug!(workload_id = %departed, "Workload no longer local, evicting");
            self.context.metrics.remove_workload(&departed);
        }

        if workloads.is_empty() {
            return;
        }
        let host: Arc<str> = match self.locator.hostname() {
            Ok(name) => Arc::from(name),
            Err(_) => return,
        };

        for workload in &workloads {
            for kind in MetricKind::ALL {
                let context = Arc::clone(&self.context);
                let host = Arc::clone(&host);
                let workload_id = workload.id.clone();
                self.tasks
                    .spawn(async move { dispatch(context, host, workload_id, kind).await });
            }
        }

        debug!(
            tick = self.tick_count,
            workloads = workloads.len(),
            outstanding = self.tasks.len(),
            "Dispatched collection tick"
        );
    }

    fn reap(&mut self, result: Result<DispatchOutcome, JoinError>) {
        match result {
            Ok(DispatchOutcome::Cpu(sample)) => {
                if let Some(percent) = self.cpu_cache.observe(&sample) {
                    debug!(
                        workload_id = %sample.workload_id,
                        cpu_percent = percent,
                        "CPU utilisation"
                    );
                    self.context
                        .metrics
                        .set_workload_cpu_percent(&sample.workload_id, percent);
                }
            }
            Ok(DispatchOutcome::Memory) | Ok(DispatchOutcome::Skipped) => {}
            Err(e) if e.is_cancelled() => {}
            Err(e) => error!(error = %e, "Dispatch task failed"),
        }
    }

    /// Wait for every outstanding dispatch; a stop command cuts this short
    async fn drain(&mut self) {
        self.set_state(SchedulerState::Draining);
        info!(outstanding = self.tasks.len(), "Draining in-flight collection");

        loop {
            tokio::select! {
                result = self.tasks.join_next() => match result {
                    Some(result) => self.reap(result),
                    None => break,
                },
                Some(SchedulerCommand::Stop) = self.commands.recv() => {
                    warn!("Stop requested while draining");
                    self.abandon();
                    break;
                }
            }
        }
    }

    fn abandon(&mut self) {
        if !self.tasks.is_empty() {
            warn!(
                outstanding = self.tasks.len(),
                "Abandoning in-flight collection"
            );
        }
        self.tasks.abort_all();
    }
}

/// Read one metric of one workload and report it
async fn dispatch(
    context: Arc<DispatchContext>,
    host: Arc<str>,
    workload_id: String,
    kind: MetricKind,
) -> DispatchOutcome {
    let read: Result<UsageSample, UsageError> = match kind {
        MetricKind::Cpu => context
            .source
            .read_cpu_usage(&workload_id)
            .await
            .map(UsageSample::Cpu),
        MetricKind::Memory => context
            .source
            .read_memory_usage(&workload_id)
            .await
            .map(UsageSample::Memory),
    };

    let sample = match read {
        Ok(sample) => sample,
        Err(e) if e.is_not_found() => {
            debug!(workload_id = %workload_id, kind = %kind, "Workload gone, skipping");
            return DispatchOutcome::Skipped;
        }
        Err(e) => {
            error!(
                workload_id = %workload_id,
                kind = %kind,
                error = %e,
                "Failed to read usage"
            );
            context.metrics.inc_read_errors(kind.as_str());
            return DispatchOutcome::Skipped;
        }
    };

    match Envelope::seal(&sample, &*host) {
        Ok(envelope) => match context.reporter.send(envelope).await {
            Ok(()) => context.metrics.inc_samples_sent(kind.as_str()),
            Err(e) => {
                error!(
                    workload_id = %workload_id,
                    kind = %kind,
                    error = %e,
                    "Failed to report sample, dropping it"
                );
                context.metrics.inc_send_errors();
            }
        },
        Err(e) => error!(workload_id = %workload_id, error = %e, "Failed to encode sample"),
    }

    match sample {
        UsageSample::Cpu(sample) => DispatchOutcome::Cpu(sample),
        UsageSample::Memory(_) => DispatchOutcome::Memory,
    }
}

/// Builder for creating the collection scheduler
pub struct CollectionSchedulerBuilder {
    locator: Option<WorkloadLocator>,
    source: Option<Arc<dyn UsageSource>>,
    reporter: Option<ReporterHandle>,
    health: Option<HealthRegistry>,
    config: CollectionConfig,
}

impl CollectionSchedulerBuilder {
    pub fn new() -> Self {
        Self {
            locator: None,
            source: None,
            reporter: None,
            health: None,
            config: CollectionConfig::default(),
        }
    }

    pub fn locator(mut self, locator: WorkloadLocator) -> Self {
        self.locator = Some(locator);
        self
    }

    pub fn source(mut self, source: Arc<dyn UsageSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn reporter(mut self, reporter: ReporterHandle) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn build(self) -> Result<(CollectionScheduler, SchedulerHandle)> {
        let locator = self
            .locator
            .ok_or_else(|| anyhow::anyhow!("Workload locator is required"))?;
        let source = self
            .source
            .ok_or_else(|| anyhow::anyhow!("Usage source is required"))?;
        let reporter = self
            .reporter
            .ok_or_else(|| anyhow::anyhow!("Reporter is required"))?;
        if self.config.interval.is_zero() {
            anyhow::bail!("Collection interval must be greater than zero");
        }

        let (mut scheduler, handle) =
            CollectionScheduler::new(locator, source, reporter, self.config);
        scheduler.health = self.health;
        Ok((scheduler, handle))
    }
}

impl Default for CollectionSchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
