//! End-to-end campaign runs against the scripted mock subject.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use vigil_agent::{AgentConfig, ChatProvider, mock::MockProvider};
use vigil_audit::AuditStore;
use vigil_core::{
    CampaignSpec, ChaosKind, ChaosSpec, EntityState, TrialOutcome, TrialStatus,
};
use vigil_harness::{CampaignRunner, ChaosInjector, ChaosRegistry, HarnessConfig, HarnessError};
use vigil_scorer::StaticClassifier;
use vigil_store::{CampaignStore, TicketStore, TicketStoreConfig, connect_memory, run_migrations};
use vigil_subject::SubjectParts;
use vigil_subject::adapters::mock::MockSubject;

/// Chaos injector that downs one mock entity and tracks concurrency.
struct RecordingChaos {
    kind: ChaosKind,
    subject: Arc<MockSubject>,
    active: Arc<AtomicU32>,
    max_active: Arc<AtomicU32>,
    injections: Arc<AtomicU32>,
    inject_delay: Duration,
}

#[async_trait]
impl ChaosInjector for RecordingChaos {
    fn kind(&self) -> ChaosKind {
        self.kind
    }

    async fn inject(&self, _params: &HashMap<String, Value>) -> Result<Value, HarnessError> {
        self.injections.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        tokio::time::sleep(self.inject_delay).await;
        self.subject.set_entity_state("n0", EntityState::Down);
        Ok(json!({ "container": "n0" }))
    }

    async fn cleanup(&self, _metadata: &Value) -> Result<(), HarnessError> {
        self.subject.set_entity_state("n0", EntityState::Up);
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

struct TestHarness {
    runner: CampaignRunner,
    subject: Arc<MockSubject>,
    campaigns: Arc<CampaignStore>,
    injections: Arc<AtomicU32>,
    max_active: Arc<AtomicU32>,
}

async fn harness(provider: Arc<dyn ChatProvider>, inject_delay: Duration) -> TestHarness {
    let pool = connect_memory().await.unwrap();
    run_migrations(&pool).await.unwrap();
    let tickets = Arc::new(TicketStore::new(pool.clone(), TicketStoreConfig::default()));
    let campaigns = Arc::new(CampaignStore::new(pool.clone()));
    let audit = Arc::new(AuditStore::new(pool).await.unwrap());

    let (subject, checker) = MockSubject::healthy(3);
    let active = Arc::new(AtomicU32::new(0));
    let max_active = Arc::new(AtomicU32::new(0));
    let injections = Arc::new(AtomicU32::new(0));

    let mut chaos = ChaosRegistry::new();
    chaos.insert(Arc::new(vigil_harness::chaos::NoneChaos));
    for kind in [ChaosKind::NodeKill, ChaosKind::Latency] {
        chaos.insert(Arc::new(RecordingChaos {
            kind,
            subject: Arc::clone(&subject),
            active: Arc::clone(&active),
            max_active: Arc::clone(&max_active),
            injections: Arc::clone(&injections),
            inject_delay,
        }));
    }

    let config = HarnessConfig {
        monitor_interval: Duration::from_millis(100),
        reset_timeout: Duration::from_secs(10),
        detection_timeout: Duration::from_secs(2),
        trial_timeout: Duration::from_secs(10),
        agent: AgentConfig {
            provider_backoff: Duration::ZERO,
            ..AgentConfig::default()
        },
    };

    let mut subjects: HashMap<String, SubjectParts> = HashMap::new();
    subjects.insert("mock".to_owned(), (subject.clone(), checker));

    let runner = CampaignRunner::new(
        subjects,
        provider,
        tickets,
        Arc::clone(&campaigns),
        audit,
        chaos,
        config,
    );

    TestHarness {
        runner,
        subject,
        campaigns,
        injections,
        max_active,
    }
}

fn spec(chaos: Vec<ChaosSpec>, trials_per: u32, parallel: u32, baseline: bool) -> CampaignSpec {
    CampaignSpec {
        name: "e2e".into(),
        subjects: vec!["mock".into()],
        chaos_types: chaos,
        trials_per_combination: trials_per,
        parallel,
        cooldown_seconds: 0,
        include_baseline: baseline,
    }
}

fn kill_spec() -> ChaosSpec {
    ChaosSpec {
        kind: ChaosKind::NodeKill,
        params: HashMap::from([("container".to_owned(), json!("n0"))]),
    }
}

fn latency_spec() -> ChaosSpec {
    ChaosSpec {
        kind: ChaosKind::Latency,
        params: HashMap::from([
            ("container".to_owned(), json!("n0")),
            ("min_ms".to_owned(), json!(50)),
            ("max_ms".to_owned(), json!(100)),
        ]),
    }
}

#[tokio::test]
async fn campaign_runs_the_full_matrix_and_scores() {
    let provider = Arc::new(MockProvider::repeating(MockProvider::text_turn(
        "looked around; nothing more to do",
    )));
    let h = harness(provider, Duration::ZERO).await;

    // 1 subject x 2 chaos x 2 repeats + 1 baseline = 5 trials.
    let campaign_spec = spec(vec![kill_spec(), latency_spec()], 2, 1, true);
    let campaign = h
        .runner
        .run(&campaign_spec, &CancellationToken::new())
        .await
        .unwrap();

    let trials = h.campaigns.trials_for(&campaign.id).await.unwrap();
    assert_eq!(trials.len(), 5);
    assert!(trials.iter().all(|t| t.status == TrialStatus::Complete));
    assert_eq!(h.injections.load(Ordering::SeqCst), 4);

    // Every chaos trial got a ticket filed and linked while it ran.
    for trial in trials.iter().filter(|t| !t.is_baseline()) {
        assert!(trial.chaos_injected_at.is_some());
        assert!(
            !trial.ticket_ids.is_empty(),
            "trial {} has no linked tickets",
            trial.id
        );
        assert!(trial.agent_session_id.is_some());
    }

    // The baseline ends healthy and scores as the campaign's only success.
    let classifier = StaticClassifier::default();
    let (scores, summary) = h
        .runner
        .score_campaign(&campaign.id, &classifier)
        .await
        .unwrap();
    assert_eq!(scores.len(), 5);
    assert_eq!(summary.total_trials, 5);
    assert_eq!(summary.successes, 1);
    assert!(summary.win_rate > 0.19 && summary.win_rate < 0.21);
    assert!(
        scores
            .iter()
            .filter(|s| s.outcome == TrialOutcome::Success)
            .count()
            == 1
    );
    // Chaos trials have a defined detection time.
    assert!(summary.avg_time_to_detect_seconds.is_some());
}

#[tokio::test]
async fn parallelism_is_bounded_by_the_semaphore() {
    let provider = Arc::new(MockProvider::repeating(MockProvider::text_turn("done")));
    let h = harness(provider, Duration::from_millis(300)).await;

    let campaign_spec = spec(vec![kill_spec()], 6, 2, false);
    h.runner
        .run(&campaign_spec, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(h.injections.load(Ordering::SeqCst), 6);
    assert!(
        h.max_active.load(Ordering::SeqCst) <= 2,
        "more than `parallel` trials ran at once"
    );
}

#[tokio::test]
async fn resume_runs_only_unfinished_trials() {
    let provider = Arc::new(MockProvider::repeating(MockProvider::text_turn("done")));
    let h = harness(provider, Duration::ZERO).await;

    // Create the campaign with a pre-cancelled token: rows land as pending,
    // nothing executes.
    let cancelled = CancellationToken::new();
    cancelled.cancel();
    let campaign_spec = spec(vec![kill_spec(), latency_spec()], 2, 2, false);
    let campaign = h.runner.run(&campaign_spec, &cancelled).await.unwrap();
    assert_eq!(h.subject.reset_count(), 0);

    // Simulate a previous runner that finished three trials and died with
    // one mid-flight.
    let mut rows = h.campaigns.resumable_trials(&campaign.id).await.unwrap();
    assert_eq!(rows.len(), 8);
    for row in rows.iter_mut().take(3) {
        row.status = TrialStatus::Complete;
        row.started_at = Some(Utc::now());
        row.ended_at = Some(Utc::now());
        h.campaigns.update_trial(row).await.unwrap();
    }
    rows[3].status = TrialStatus::Running;
    h.campaigns.update_trial(&rows[3]).await.unwrap();

    // Resume executes the five unfinished rows exactly once each.
    h.runner
        .resume(&campaign.id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(h.subject.reset_count(), 5);

    let finished = h.campaigns.trials_for(&campaign.id).await.unwrap();
    assert_eq!(finished.len(), 8);
    assert!(finished.iter().all(|t| t.status == TrialStatus::Complete));
    assert!(
        h.campaigns
            .resumable_trials(&campaign.id)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn cancellation_interrupts_running_trials() {
    // The agent hangs in a long shell call so cancellation lands mid-trial.
    let provider = Arc::new(MockProvider::repeating(MockProvider::tool_use_turn(
        "tc", "sleep 30",
    )));
    let h = harness(provider, Duration::ZERO).await;

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(800)).await;
        canceller.cancel();
    });

    let campaign_spec = spec(vec![kill_spec()], 1, 1, false);
    let started = std::time::Instant::now();
    let campaign = h.runner.run(&campaign_spec, &cancel).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));

    let trials = h.campaigns.trials_for(&campaign.id).await.unwrap();
    assert_eq!(trials.len(), 1);
    assert_eq!(trials[0].status, TrialStatus::Failed);
    assert_eq!(trials[0].error.as_deref(), Some("interrupted"));
}
