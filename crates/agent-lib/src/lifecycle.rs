//! Operator-driven lifecycle
//!
//! Maps process signals onto scheduler and pipeline actions:
//!
//! | Signal           | Action                                              |
//! |------------------|-----------------------------------------------------|
//! | SIGQUIT, SIGINT  | drain the scheduler, then close the pipeline        |
//! | SIGTERM          | stop the scheduler and close the pipeline at once   |
//! | SIGHUP           | run the reload hook                                 |
//!
//! Only the first stop is acted on.

use crate::collector::{SchedulerHandle, SchedulerState};
use crate::health::HealthRegistry;
use crate::observability::StructuredLogger;
use crate::sync::ReporterHandle;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Operator request, decoupled from the OS signal that carried it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    GracefulQuit,
    FastStop,
    Reload,
}

impl ControlSignal {
    pub fn is_stop(&self) -> bool {
        !matches!(self, ControlSignal::Reload)
    }
}

/// How the agent came down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every in-flight dispatch finished before the pipeline closed
    Drained,
    /// In-flight dispatches were abandoned
    Stopped,
}

/// Hook run on reload requests
///
/// Runs on the blocking pool, so it may do synchronous file I/O.
pub type ReloadHook = Box<dyn FnMut() -> anyhow::Result<()> + Send>;

/// Install OS signal handlers and forward them as [`ControlSignal`]s
pub fn spawn_signal_listener() -> std::io::Result<mpsc::Receiver<ControlSignal>> {
    let mut quit = signal(SignalKind::quit())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        loop {
            let control = tokio::select! {
                Some(()) = quit.recv() => ControlSignal::GracefulQuit,
                Some(()) = interrupt.recv() => ControlSignal::GracefulQuit,
                Some(()) = terminate.recv() => ControlSignal::FastStop,
                Some(()) = hangup.recv() => ControlSignal::Reload,
                else => break,
            };

            info!(signal = ?control, "Received control signal");
            if tx.send(control).await.is_err() {
                break;
            }
        }
    });

    Ok(rx)
}

pub struct LifecycleCoordinator {
    scheduler: SchedulerHandle,
    reporter: ReporterHandle,
    reload: Option<ReloadHook>,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
}

impl LifecycleCoordinator {
    pub fn new(
        scheduler: SchedulerHandle,
        reporter: ReporterHandle,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            scheduler,
            reporter,
            reload: None,
            logger,
            health: None,
        }
    }

    pub fn with_reload_hook(mut self, hook: ReloadHook) -> Self {
        self.reload = Some(hook);
        self
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Handle control signals until the agent has shut down
    ///
    /// A closed signal channel is handled like a graceful quit.
    pub async fn run(mut self, mut signals: mpsc::Receiver<ControlSignal>) -> ShutdownOutcome {
        let mut announced = false;

        let request = loop {
            tokio::select! {
                _ = self.scheduler.wait_running(), if !announced => {
                    announced = true;
                    if self.scheduler.state() == SchedulerState::Running {
                        if let Some(health) = &self.health {
                            health.set_ready(true).await;
                        }
                    }
                }
                control = signals.recv() => match control {
                    Some(ControlSignal::Reload) => self.reload().await,
                    Some(stop) => break stop,
                    None => {
                        warn!("Signal channel closed, shutting down");
                        break ControlSignal::GracefulQuit;
                    }
                },
            }
        };

        self.shutdown(request, &mut signals).await
    }

    async fn reload(&mut self) {
        let Some(mut hook) = self.reload.take() else {
            info!("Reload requested, nothing to reload");
            return;
        };

        let ran = tokio::task::spawn_blocking(move || {
            let result = hook();
            (hook, result)
        })
        .await;

        match ran {
            Ok((hook, result)) => {
                self.reload = Some(hook);
                self.logger.log_reload(&result);
            }
            Err(e) => error!(error = %e, "Reload hook panicked, further reloads disabled"),
        }
    }

    async fn shutdown(
        &mut self,
        request: ControlSignal,
        signals: &mut mpsc::Receiver<ControlSignal>,
    ) -> ShutdownOutcome {
        if let Some(health) = &self.health {
            health.set_ready(false).await;
        }

        let started = self.scheduler.state() != SchedulerState::Idle;
        let graceful = request == ControlSignal::GracefulQuit && started;
        if request == ControlSignal::GracefulQuit && !started {
            warn!("Quit requested before collection started, stopping immediately");
        }

        let outcome = if graceful {
            self.scheduler.drain().await;
            loop {
                tokio::select! {
                    _ = self.scheduler.wait_stopped() => break,
                    Some(control) = signals.recv() => self.ignore(control),
                }
            }
            ShutdownOutcome::Drained
        } else {
            self.scheduler.stop().await;
            ShutdownOutcome::Stopped
        };

        self.reporter.close().await;

        let reason = match request {
            ControlSignal::FastStop => "fast_stop",
            _ => "graceful_quit",
        };
        self.logger
            .log_shutdown(reason, outcome == ShutdownOutcome::Drained);
        outcome
    }

    fn ignore(&self, control: ControlSignal) {
        if control.is_stop() {
            warn!(signal = ?control, "Shutdown already in progress, ignoring");
        } else {
            info!(signal = ?control, "Shutting down, ignoring reload");
        }
    }
}
