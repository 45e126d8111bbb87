//! Trial execution: reset, inject, agent, snapshot, cleanup, persist.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vigil_agent::{AgentConfig, AgentSession, ChatProvider, build_initial_context};
use vigil_audit::AuditStore;
use vigil_core::{Trial, TrialStatus};
use vigil_monitor::{Monitor, MonitorConfig};
use vigil_store::{CampaignStore, TicketStore};
use vigil_subject::{InvariantChecker, Subject};

use crate::chaos::ChaosRegistry;
use crate::error::HarnessError;

/// Harness-wide tuning shared by every trial.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Tick interval for the trial-scoped monitor.
    pub monitor_interval: Duration,
    /// Bound on reset plus wait-until-healthy.
    pub reset_timeout: Duration,
    /// How long to wait for the monitor to file a ticket before the agent
    /// starts anyway.
    pub detection_timeout: Duration,
    /// Wall-clock bound for the agent session.
    pub trial_timeout: Duration,
    pub agent: AgentConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(2),
            reset_timeout: Duration::from_secs(60),
            detection_timeout: Duration::from_secs(10),
            trial_timeout: Duration::from_secs(300),
            agent: AgentConfig::default(),
        }
    }
}

/// Runs one trial end to end against one subject.
///
/// Ordering within a trial is strictly sequential: reset, inject, agent
/// session, snapshot, cleanup, persist. A monitor scoped to the trial runs
/// concurrently so violations become tickets while the agent works.
pub struct TrialExecutor {
    subject: Arc<dyn Subject>,
    checker: Arc<dyn InvariantChecker>,
    provider: Arc<dyn ChatProvider>,
    tickets: Arc<TicketStore>,
    campaigns: Arc<CampaignStore>,
    audit: Arc<AuditStore>,
    chaos: ChaosRegistry,
    config: HarnessConfig,
}

impl TrialExecutor {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        subject: Arc<dyn Subject>,
        checker: Arc<dyn InvariantChecker>,
        provider: Arc<dyn ChatProvider>,
        tickets: Arc<TicketStore>,
        campaigns: Arc<CampaignStore>,
        audit: Arc<AuditStore>,
        chaos: ChaosRegistry,
        config: HarnessConfig,
    ) -> Self {
        Self {
            subject,
            checker,
            provider,
            tickets,
            campaigns,
            audit,
            chaos,
            config,
        }
    }

    /// Execute one trial and persist its full record. Trial-level failures
    /// (chaos, subject, agent) are recorded on the row and returned as
    /// `Ok`; only storage failures surface as `Err`.
    pub async fn execute(
        &self,
        mut trial: Trial,
        cancel: &CancellationToken,
    ) -> Result<Trial, HarnessError> {
        trial.status = TrialStatus::Running;
        trial.started_at = Some(Utc::now());
        self.campaigns.update_trial(&trial).await?;
        info!(trial = %trial.id, subject = %trial.subject, chaos = %trial.chaos_kind, "trial started");

        let monitor_cancel = CancellationToken::new();
        let mut monitor = Monitor::new(
            Arc::clone(&self.subject),
            Arc::clone(&self.checker),
            Arc::clone(&self.tickets),
            MonitorConfig {
                interval: self.config.monitor_interval,
                observe_margin: Duration::ZERO,
            },
        );
        let monitor_token = monitor_cancel.clone();
        let monitor_task = tokio::spawn(async move {
            if let Err(e) = monitor.run(monitor_token).await {
                warn!(error = %e, "trial monitor exited with error");
            }
        });

        let phases = tokio::select! {
            result = self.run_phases(&mut trial, cancel) => result,
            () = cancel.cancelled() => Err(HarnessError::Agent("interrupted".into())),
        };

        monitor_cancel.cancel();
        let _ = monitor_task.await;

        match phases {
            Ok(()) => trial.status = TrialStatus::Complete,
            Err(e) => {
                trial.status = TrialStatus::Failed;
                trial.error = Some(if cancel.is_cancelled() {
                    "interrupted".to_owned()
                } else {
                    e.to_string()
                });
                warn!(trial = %trial.id, error = %e, "trial failed");
            }
        }
        trial.ended_at = Some(Utc::now());

        if let (Some(started), Some(ended)) = (trial.started_at, trial.ended_at) {
            trial.ticket_ids = self
                .tickets
                .created_between(started, ended)
                .await?
                .iter()
                .map(|t| t.id)
                .collect();
        }

        self.campaigns.update_trial(&trial).await?;
        info!(trial = %trial.id, status = ?trial.status, tickets = trial.ticket_ids.len(), "trial persisted");
        Ok(trial)
    }

    async fn run_phases(
        &self,
        trial: &mut Trial,
        cancel: &CancellationToken,
    ) -> Result<(), HarnessError> {
        // Reset to a known-healthy baseline, bounded.
        self.subject
            .reset()
            .await
            .map_err(|e| HarnessError::Subject(e.to_string()))?;
        self.subject
            .wait_healthy(self.config.reset_timeout)
            .await
            .map_err(|e| HarnessError::Subject(e.to_string()))?;

        // Let the monitor observe the clean baseline once so tickets left
        // over from an earlier trial auto-resolve before the fault lands.
        tokio::time::sleep(self.config.monitor_interval).await;

        // Inject the fault and remember everything cleanup needs.
        let injector = self.chaos.get(trial.chaos_kind)?;
        let params: HashMap<String, serde_json::Value> = trial
            .chaos_params
            .as_object()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        match injector.inject(&params).await {
            Ok(metadata) => {
                trial.chaos_metadata = metadata;
                trial.chaos_injected_at = Some(Utc::now());
                self.campaigns.update_trial(trial).await?;
            }
            Err(e) => {
                // Inject failure skips the agent but still cleans up.
                if let Err(cleanup_err) = injector.cleanup(&trial.chaos_metadata).await {
                    warn!(trial = %trial.id, error = %cleanup_err, "cleanup after failed inject");
                }
                return Err(e);
            }
        }

        // Give the trial monitor a chance to file the first ticket so the
        // agent starts with context; proceed regardless once the bound hits.
        if !trial.is_baseline() {
            let detection_deadline = tokio::time::Instant::now() + self.config.detection_timeout;
            loop {
                if !self.tickets.open_keys().await?.is_empty()
                    || tokio::time::Instant::now() >= detection_deadline
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }

        // Agent session, bounded by the trial timeout.
        let open_tickets = self
            .tickets
            .list(Some(vigil_core::TicketStatus::Open))
            .await?;
        let snapshot = match self.subject.observe().await {
            Ok(obs) => Some(obs.snapshot()),
            Err(_) => None,
        };
        let context = build_initial_context(
            &self.subject.config(),
            &self.subject.action_definitions(),
            &open_tickets,
            snapshot.as_ref(),
        );

        let agent_config = AgentConfig {
            deadline: Some(self.config.trial_timeout),
            ..self.config.agent.clone()
        };
        let session = AgentSession::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.audit),
            agent_config,
        );
        let report = session
            .run(&context, cancel)
            .await
            .map_err(|e| HarnessError::Agent(e.to_string()))?;
        trial.agent_session_id = Some(report.session_id);

        // Snapshot before cleanup so the score sees what the agent left.
        trial.final_state = self
            .subject
            .snapshot_state()
            .await
            .map_err(|e| HarnessError::Subject(e.to_string()))?;

        if let Err(e) = injector.cleanup(&trial.chaos_metadata).await {
            warn!(trial = %trial.id, error = %e, "chaos cleanup failed; next reset must recover");
        }

        Ok(())
    }
}
