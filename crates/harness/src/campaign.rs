//! Campaign runner: matrix expansion, bounded parallelism, resumability.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vigil_agent::ChatProvider;
use vigil_audit::AuditStore;
use vigil_core::{Campaign, CampaignSpec, CampaignSummary, ChaosKind, Trial, TrialScore, TrialStatus};
use vigil_scorer::{CommandClassifier, analyze_campaign, score_trial};
use vigil_store::{CampaignStore, TicketStore};
use vigil_subject::SubjectParts;

use crate::chaos::ChaosRegistry;
use crate::config::validate_support;
use crate::error::HarnessError;
use crate::trial::{HarnessConfig, TrialExecutor};

/// Executes campaigns against a set of constructed subjects.
///
/// Trials fan out under a counting semaphore of size `parallel`; a subject
/// that cannot host independent parallel copies clamps the whole campaign
/// to serial execution.
pub struct CampaignRunner {
    subjects: HashMap<String, SubjectParts>,
    executors: HashMap<String, Arc<TrialExecutor>>,
    campaigns: Arc<CampaignStore>,
    tickets: Arc<TicketStore>,
    audit: Arc<AuditStore>,
}

impl CampaignRunner {
    #[must_use]
    pub fn new(
        subjects: HashMap<String, SubjectParts>,
        provider: Arc<dyn ChatProvider>,
        tickets: Arc<TicketStore>,
        campaigns: Arc<CampaignStore>,
        audit: Arc<AuditStore>,
        chaos: ChaosRegistry,
        config: HarnessConfig,
    ) -> Self {
        let executors = subjects
            .iter()
            .map(|(name, (subject, checker))| {
                let executor = TrialExecutor::new(
                    Arc::clone(subject),
                    Arc::clone(checker),
                    Arc::clone(&provider),
                    Arc::clone(&tickets),
                    Arc::clone(&campaigns),
                    Arc::clone(&audit),
                    chaos.clone(),
                    config.clone(),
                );
                (name.clone(), Arc::new(executor))
            })
            .collect();
        Self {
            subjects,
            executors,
            campaigns,
            tickets,
            audit,
        }
    }

    /// Start a fresh campaign: create the row, expand the matrix into
    /// pending trials, and execute them.
    pub async fn run(
        &self,
        spec: &CampaignSpec,
        cancel: &CancellationToken,
    ) -> Result<Campaign, HarnessError> {
        let supported: HashMap<String, Vec<ChaosKind>> = self
            .subjects
            .iter()
            .map(|(name, (subject, _))| (name.clone(), subject.supported_chaos()))
            .collect();
        validate_support(spec, &supported)?;

        let campaign = Campaign::new(spec);
        self.campaigns.create_campaign(&campaign).await?;
        let trials: Vec<Trial> = spec
            .expand()
            .iter()
            .map(|trial_spec| Trial::pending(&campaign.id, trial_spec))
            .collect();
        self.campaigns.insert_trials(&trials).await?;
        info!(campaign = %campaign.id, trials = trials.len(), "campaign created");

        self.execute_all(trials, self.effective_parallel(spec), spec.cooldown_seconds, cancel)
            .await;
        Ok(campaign)
    }

    /// Resume an existing campaign: re-run `pending` rows plus `running`
    /// rows left behind by an interrupted runner. Completed trials are
    /// never executed twice.
    pub async fn resume(
        &self,
        campaign_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Campaign, HarnessError> {
        let campaign = self.campaigns.get_campaign(campaign_id).await?;
        let spec: CampaignSpec = serde_json::from_value(campaign.config.clone())
            .map_err(|e| HarnessError::Config(format!("stored campaign config: {e}")))?;
        let remaining = self.campaigns.resumable_trials(campaign_id).await?;
        info!(campaign = campaign_id, remaining = remaining.len(), "resuming campaign");

        self.execute_all(
            remaining,
            self.effective_parallel(&spec),
            spec.cooldown_seconds,
            cancel,
        )
        .await;
        Ok(campaign)
    }

    /// The parallelism actually used: the configured value, clamped to 1
    /// when any subject cannot run isolated parallel trials.
    fn effective_parallel(&self, spec: &CampaignSpec) -> u32 {
        let all_parallel = spec.subjects.iter().all(|name| {
            self.subjects
                .get(name)
                .is_some_and(|(subject, _)| subject.supports_parallel_trials())
        });
        if all_parallel {
            spec.parallel
        } else {
            if spec.parallel > 1 {
                warn!("subject does not support parallel trials; clamping parallelism to 1");
            }
            1
        }
    }

    async fn execute_all(
        &self,
        trials: Vec<Trial>,
        parallel: u32,
        cooldown_seconds: u64,
        cancel: &CancellationToken,
    ) {
        let semaphore = Arc::new(Semaphore::new(parallel as usize));
        let cooldown = Duration::from_secs(cooldown_seconds);
        let mut handles = Vec::new();
        let mut first = true;

        for trial in trials {
            if cancel.is_cancelled() {
                break;
            }
            // Global cooldown between trial launches, not per worker.
            if !first && !cooldown.is_zero() {
                tokio::select! {
                    () = tokio::time::sleep(cooldown) => {}
                    () = cancel.cancelled() => break,
                }
            }
            first = false;

            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                () = cancel.cancelled() => break,
            };

            let Some(executor) = self.executors.get(&trial.subject).cloned() else {
                error!(trial = %trial.id, subject = %trial.subject, "no executor for subject");
                let mut failed = trial;
                failed.status = TrialStatus::Failed;
                failed.error = Some(format!("unknown subject `{}`", failed.subject));
                if let Err(e) = self.campaigns.update_trial(&failed).await {
                    error!(error = %e, "failed to persist unknown-subject trial");
                }
                continue;
            };

            let trial_cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let result = executor.execute(trial, &trial_cancel).await;
                drop(permit);
                result
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(Ok(trial)) => {
                    info!(trial = %trial.id, status = ?trial.status, "trial finished");
                }
                Ok(Err(e)) => error!(error = %e, "trial hit a storage failure"),
                Err(e) => error!(error = %e, "trial task panicked"),
            }
        }
    }

    /// Score every completed trial of a campaign and aggregate. Read-only:
    /// scoring writes nothing anywhere.
    pub async fn score_campaign(
        &self,
        campaign_id: &str,
        classifier: &dyn CommandClassifier,
    ) -> Result<(Vec<TrialScore>, CampaignSummary), HarnessError> {
        let trials = self.campaigns.trials_for(campaign_id).await?;
        let mut scores = Vec::new();

        for trial in trials
            .iter()
            .filter(|t| t.status == TrialStatus::Complete)
        {
            let (entries, session_outcome) = match &trial.agent_session_id {
                Some(session_id) => {
                    let entries = self.audit.entries(session_id).await?;
                    let outcome = self.audit.get_session(session_id).await?.outcome;
                    (entries, outcome)
                }
                None => (Vec::new(), None),
            };

            let mut tickets = Vec::with_capacity(trial.ticket_ids.len());
            for ticket_id in &trial.ticket_ids {
                tickets.push(self.tickets.get(*ticket_id).await?);
            }

            let healthy = self
                .subjects
                .get(&trial.subject)
                .is_some_and(|(subject, _)| subject.is_healthy(&trial.final_state));

            let score = score_trial(
                trial,
                session_outcome.as_deref(),
                &entries,
                &tickets,
                healthy,
                classifier,
            )
            .await
            .map_err(|e| HarnessError::Agent(e.to_string()))?;
            scores.push(score);
        }

        let summary = analyze_campaign(&scores);
        Ok((scores, summary))
    }
}
