//! Collector connection owner
//!
//! A single actor task owns the TCP connection to the central collector.
//! Dispatchers never touch the socket: they submit envelopes through a
//! [`ReporterHandle`] and wait for the write result, so concurrent writes
//! are serialized without interleaving partial lines.
//!
//! On connection loss the actor re-dials lazily on the next send, backing
//! off exponentially between attempts. Sends arriving while backing off
//! fail fast and the sample is dropped; nothing is queued for later.

use super::envelope::Envelope;
use crate::health::{components, HealthRegistry};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Configuration for the collector connection
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Collector address as `host:port`
    pub collector_addr: String,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Longest a single envelope write may block before the connection is dropped
    pub write_timeout: Duration,
    /// Re-dial after connection loss; when false a lost connection is final
    pub reconnect: bool,
    /// Initial backoff for reconnection
    pub initial_backoff: Duration,
    /// Maximum backoff for reconnection
    pub max_backoff: Duration,
    /// Number of envelopes that may wait for the writer
    pub channel_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            collector_addr: "127.0.0.1:3001".to_string(),
            connect_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(30),
            reconnect: true,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300), // 5 minutes
            channel_buffer_size: 1000,
        }
    }
}

impl ClientConfig {
    pub fn with_addr(collector_addr: impl Into<String>) -> Self {
        Self {
            collector_addr: collector_addr.into(),
            ..Default::default()
        }
    }
}

/// Failure to deliver an envelope to the collector
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to connect to collector at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("connecting to collector at {addr} timed out")]
    ConnectTimeout { addr: String },
    #[error("write to collector failed: {0}")]
    Write(#[source] io::Error),
    #[error("write to collector timed out after {timeout:?}")]
    WriteTimeout { timeout: Duration },
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("collector connection down, next attempt in {retry_in:?}")]
    Disconnected { retry_in: Duration },
    #[error("collector connection lost")]
    ConnectionLost,
    #[error("reporting pipeline closed")]
    Closed,
}

/// Connection state for tracking reconnection attempts
#[derive(Debug, Clone)]
struct ConnectionState {
    reconnect_attempts: u32,
    current_backoff: Duration,
    next_attempt: Option<Instant>,
    last_error: Option<String>,
}

impl ConnectionState {
    fn new(initial_backoff: Duration) -> Self {
        Self {
            reconnect_attempts: 0,
            current_backoff: initial_backoff,
            next_attempt: None,
            last_error: None,
        }
    }
}

enum Command {
    Send {
        envelope: Envelope,
        reply: oneshot::Sender<Result<(), ReportError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable entry point for submitting envelopes
#[derive(Clone)]
pub struct ReporterHandle {
    tx: mpsc::Sender<Command>,
}

impl ReporterHandle {
    /// Write one envelope to the collector
    ///
    /// Completes once the envelope has been written or the write failed.
    /// No ordering holds between concurrent callers.
    pub async fn send(&self, envelope: Envelope) -> Result<(), ReportError> {
        let (reply, result) = oneshot::channel();
        self.tx
            .send(Command::Send { envelope, reply })
            .await
            .map_err(|_| ReportError::Closed)?;

        result.await.map_err(|_| ReportError::Closed)?
    }

    /// Release the connection; later sends fail with [`ReportError::Closed`]
    pub async fn close(&self) {
        let (reply, done) = oneshot::channel();
        if self.tx.send(Command::Close { reply }).await.is_ok() {
            let _ = done.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Actor owning the collector connection
pub struct ReportingPipeline {
    config: ClientConfig,
    stream: Option<TcpStream>,
    state: ConnectionState,
    receiver: mpsc::Receiver<Command>,
    health: Option<HealthRegistry>,
}

impl ReportingPipeline {
    /// Connect to the collector and spawn the writer task
    ///
    /// A failed initial connect is logged, not returned: the pipeline starts
    /// disconnected and follows the reconnect policy.
    pub async fn start(
        config: ClientConfig,
        health: Option<HealthRegistry>,
    ) -> (ReporterHandle, JoinHandle<()>) {
        let (tx, receiver) = mpsc::channel(config.channel_buffer_size.max(1));
        let mut pipeline = Self {
            state: ConnectionState::new(config.initial_backoff),
            config,
            stream: None,
            receiver,
            health,
        };

        if let Err(e) = pipeline.connect().await {
            error!(error = %e, "Initial connection to collector failed");
        }

        let task = tokio::spawn(pipeline.run());
        (ReporterHandle { tx }, task)
    }

    async fn run(mut self) {
        info!(addr = %self.config.collector_addr, "Starting reporting pipeline");

        while let Some(command) = self.receiver.recv().await {
            match command {
                Command::Send { envelope, reply } => {
                    let result = self.write(&envelope).await;
                    let _ = reply.send(result);
                }
                Command::Close { reply } => {
                    self.release().await;
                    self.receiver.close();
                    let _ = reply.send(());
                    break;
                }
            }
        }

        // Fail anything still queued behind a close
        self.receiver.close();
        self.release().await;
        info!("Reporting pipeline stopped");
    }

    async fn write(&mut self, envelope: &Envelope) -> Result<(), ReportError> {
        let line = envelope.to_line()?;

        if self.stream.is_none() {
            self.reconnect().await?;
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(ReportError::ConnectionLost);
        };

        let timeout = self.config.write_timeout;
        let written = tokio::time::timeout(timeout, stream.write_all(&line)).await;
        match written {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.on_connection_lost(&e).await;
                Err(ReportError::Write(e))
            }
            Err(_) => {
                // A partial line may be on the wire, so the connection cannot be reused
                let e = io::Error::new(io::ErrorKind::TimedOut, "collector stopped reading");
                self.on_connection_lost(&e).await;
                Err(ReportError::WriteTimeout { timeout })
            }
        }
    }

    async fn reconnect(&mut self) -> Result<(), ReportError> {
        if !self.config.reconnect {
            return Err(ReportError::ConnectionLost);
        }

        if let Some(next) = self.state.next_attempt {
            let now = Instant::now();
            if now < next {
                return Err(ReportError::Disconnected {
                    retry_in: next - now,
                });
            }
        }

        self.state.reconnect_attempts += 1;
        debug!(
            attempt = self.state.reconnect_attempts,
            addr = %self.config.collector_addr,
            last_error = ?self.state.last_error,
            "Reconnecting to collector"
        );
        self.connect().await
    }

    async fn connect(&mut self) -> Result<(), ReportError> {
        let addr = self.config.collector_addr.clone();
        let attempt = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&addr));

        let result = match attempt.await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(source)) => Err(ReportError::Connect { addr, source }),
            Err(_) => Err(ReportError::ConnectTimeout { addr }),
        };

        match result {
            Ok(stream) => {
                info!(
                    event = "collector_connection",
                    connected = true,
                    addr = %self.config.collector_addr,
                    "Connected to collector"
                );
                self.stream = Some(stream);
                self.state = ConnectionState::new(self.config.initial_backoff);
                if let Some(health) = &self.health {
                    health.set_healthy(components::REPORTER).await;
                }
                Ok(())
            }
            Err(e) => {
                self.schedule_retry(&e.to_string());
                if let Some(health) = &self.health {
                    health
                        .set_unhealthy(components::REPORTER, e.to_string())
                        .await;
                }
                Err(e)
            }
        }
    }

    fn schedule_retry(&mut self, error: &str) {
        let delay = self.state.current_backoff;
        self.state.next_attempt = Some(Instant::now() + delay);
        self.state.current_backoff = (delay * 2).min(self.config.max_backoff);
        self.state.last_error = Some(error.to_string());
    }

    async fn on_connection_lost(&mut self, e: &io::Error) {
        warn!(
            event = "collector_connection",
            connected = false,
            error = %e,
            addr = %self.config.collector_addr,
            "Lost connection to collector"
        );
        self.stream = None;
        // First re-dial happens on the next send without waiting
        self.state.next_attempt = None;
        self.state.last_error = Some(e.to_string());
        if let Some(health) = &self.health {
            health
                .set_unhealthy(components::REPORTER, format!("connection lost: {}", e))
                .await;
        }
    }

    async fn release(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!(error = %e, "Error shutting down collector connection");
            }
            info!("Released collector connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert!(config.reconnect);
        assert_eq!(config.initial_backoff, Duration::from_secs(1));
        assert_eq!(config.max_backoff, Duration::from_secs(300));
        assert_eq!(config.write_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_client_config_with_addr() {
        let config = ClientConfig::with_addr("collector:3001");
        assert_eq!(config.collector_addr, "collector:3001");
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_backoff_doubles_up_to_max() {
        let (_tx, receiver) = mpsc::channel(1);
        let mut pipeline = ReportingPipeline {
            config: ClientConfig {
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(5),
                ..Default::default()
            },
            stream: None,
            state: ConnectionState::new(Duration::from_secs(1)),
            receiver,
            health: None,
        };

        let mut delays = Vec::new();
        for _ in 0..5 {
            delays.push(pipeline.state.current_backoff);
            pipeline.schedule_retry("refused");
        }

        assert_eq!(
            delays,
            vec![1, 2, 4, 5, 5]
                .into_iter()
                .map(Duration::from_secs)
                .collect::<Vec<_>>()
        );
        assert!(pipeline.state.next_attempt.is_some());
        assert_eq!(pipeline.state.last_error.as_deref(), Some("refused"));
    }
}
