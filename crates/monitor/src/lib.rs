//! The monitor loop: a single-worker daemon that periodically observes a
//! subject, evaluates invariants, and maintains the ticket store.
//!
//! The monitor never mutates subject state; remediation belongs to the
//! agent. Shutdown is cooperative: a signal interrupts the between-tick
//! wait immediately but lets an in-flight tick complete.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vigil_core::{InvariantViolation, Severity};
use vigil_invariants::InvariantEngine;
use vigil_store::{StoreError, TicketStore};
use vigil_subject::{InvariantChecker, ObserveError, Subject};

/// Synthetic violation name emitted when the subject cannot be observed.
pub const CONTROL_PLANE_DOWN: &str = "control_plane_down";

/// Monitor tuning.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Gap between tick starts.
    pub interval: Duration,
    /// Safety margin subtracted from the interval to bound the observe
    /// phase; an observe that overruns abandons the tick.
    pub observe_margin: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            observe_margin: Duration::from_secs(5),
        }
    }
}

impl MonitorConfig {
    fn observe_deadline(&self) -> Duration {
        self.interval
            .saturating_sub(self.observe_margin)
            .max(Duration::from_secs(1))
    }
}

/// Failure inside one tick.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Configuration/DNS/auth failure observing the subject: not retried,
    /// the run terminates.
    #[error("fatal observe failure: {0}")]
    FatalObserve(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Heartbeat counters for external display.
#[derive(Debug, Default)]
pub struct MonitorStats {
    ticks: AtomicU64,
    violations: AtomicU64,
    resolved: AtomicU64,
}

impl MonitorStats {
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn violations(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }

    pub fn resolved(&self) -> u64 {
        self.resolved.load(Ordering::Relaxed)
    }
}

/// What one tick did.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub batch_key: String,
    pub violations: usize,
    pub resolved: Vec<i64>,
    /// Whether the tick fell back to the synthetic observe-failure path.
    pub observe_failed: bool,
}

/// The observe-check-ticket loop over one subject.
pub struct Monitor {
    subject: Arc<dyn Subject>,
    checker: Arc<dyn InvariantChecker>,
    engine: InvariantEngine,
    tickets: Arc<TicketStore>,
    config: MonitorConfig,
    stats: Arc<MonitorStats>,
}

impl Monitor {
    #[must_use]
    pub fn new(
        subject: Arc<dyn Subject>,
        checker: Arc<dyn InvariantChecker>,
        tickets: Arc<TicketStore>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            subject,
            checker,
            engine: InvariantEngine::new(),
            tickets,
            config,
            stats: Arc::new(MonitorStats::default()),
        }
    }

    /// Shared heartbeat counters.
    #[must_use]
    pub fn stats(&self) -> Arc<MonitorStats> {
        Arc::clone(&self.stats)
    }

    /// Run ticks until `shutdown` fires. The in-flight tick always
    /// completes; only the between-tick wait is interruptible.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), MonitorError> {
        info!(interval = ?self.config.interval, "monitor loop started");
        loop {
            match self.tick().await {
                Ok(outcome) => {
                    info!(
                        batch = %outcome.batch_key,
                        violations = outcome.violations,
                        resolved = outcome.resolved.len(),
                        tick = self.stats.ticks(),
                        "heartbeat"
                    );
                }
                Err(e @ MonitorError::FatalObserve(_)) => {
                    error!(error = %e, "fatal observe failure; monitor exiting");
                    return Err(e);
                }
                Err(e) => error!(error = %e, "tick failed"),
            }

            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("shutdown signal received; monitor exiting");
                    return Ok(());
                }
                () = tokio::time::sleep(self.config.interval) => {}
            }
        }
    }

    /// One observe-check-ticket cycle.
    pub async fn tick(&mut self) -> Result<TickOutcome, MonitorError> {
        let now = Utc::now();
        let batch_key = now.format("%Y%m%dT%H%M%S%.3fZ").to_string();
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);

        let observed = match tokio::time::timeout(
            self.config.observe_deadline(),
            self.subject.observe(),
        )
        .await
        {
            Ok(Ok(obs)) => Ok(obs),
            Ok(Err(ObserveError::Fatal(msg))) => return Err(MonitorError::FatalObserve(msg)),
            Ok(Err(ObserveError::Transient(msg))) => {
                warn!(error = %msg, "transient observe failure");
                Err(msg)
            }
            Err(_) => {
                warn!(deadline = ?self.config.observe_deadline(), "observe deadline exceeded");
                Err("observe deadline exceeded".to_owned())
            }
        };

        match observed {
            Ok(obs) => {
                let violations = self.engine.check(self.checker.as_ref(), &obs, now);
                self.stats
                    .violations
                    .fetch_add(violations.len() as u64, Ordering::Relaxed);
                let snapshot = obs.snapshot();

                let mut present = Vec::with_capacity(violations.len());
                for violation in &violations {
                    self.tickets
                        .open_or_update(violation, &batch_key, &snapshot)
                        .await?;
                    present.push(violation.key());
                }

                let absent: Vec<String> = self
                    .tickets
                    .open_keys()
                    .await?
                    .into_iter()
                    .filter(|key| !present.contains(key))
                    .collect();
                let resolved = self.tickets.auto_resolve(&absent).await?;
                self.stats
                    .resolved
                    .fetch_add(resolved.len() as u64, Ordering::Relaxed);

                Ok(TickOutcome {
                    batch_key,
                    violations: violations.len(),
                    resolved,
                    observe_failed: false,
                })
            }
            Err(message) => {
                // Blind tick: file the synthetic control-plane violation and
                // leave every other ticket untouched. Auto-resolve needs a
                // real observation to say anything about absence.
                let synthetic = InvariantViolation {
                    invariant: CONTROL_PLANE_DOWN.to_owned(),
                    entity_id: None,
                    severity: Severity::Critical,
                    message: format!("observe failed: {message}"),
                    first_seen: now,
                    last_seen: now,
                };
                self.tickets
                    .open_or_update(&synthetic, &batch_key, &serde_json::Value::Null)
                    .await?;
                self.stats.violations.fetch_add(1, Ordering::Relaxed);

                Ok(TickOutcome {
                    batch_key,
                    violations: 1,
                    resolved: Vec::new(),
                    observe_failed: true,
                })
            }
        }
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM and cancel the returned token.
#[must_use]
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let signalled = token.clone();
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to install Ctrl+C handler");
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => error!(error = %e, "failed to install SIGTERM handler"),
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => info!("received SIGINT"),
            () = terminate => info!("received SIGTERM"),
        }
        signalled.cancel();
    });
    token
}
