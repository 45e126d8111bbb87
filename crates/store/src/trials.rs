use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use vigil_core::{Campaign, ChaosKind, Trial, TrialStatus};

use crate::error::StoreError;

/// Persistence for campaigns and their trials.
pub struct CampaignStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct CampaignRow {
    id: String,
    name: String,
    created_at: DateTime<Utc>,
    config_json: String,
}

impl From<CampaignRow> for Campaign {
    fn from(row: CampaignRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            created_at: row.created_at,
            config: serde_json::from_str(&row.config_json).unwrap_or(serde_json::Value::Null),
        }
    }
}

#[derive(sqlx::FromRow)]
struct TrialRow {
    id: String,
    campaign_id: String,
    subject: String,
    chaos_type: String,
    chaos_params_json: String,
    status: String,
    started_at: Option<DateTime<Utc>>,
    chaos_injected_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    chaos_metadata_json: String,
    final_state_json: String,
    agent_session_id: Option<String>,
    ticket_ids_json: String,
    error: Option<String>,
}

impl From<TrialRow> for Trial {
    fn from(row: TrialRow) -> Self {
        Self {
            id: row.id,
            campaign_id: row.campaign_id,
            subject: row.subject,
            chaos_kind: ChaosKind::parse(&row.chaos_type).unwrap_or(ChaosKind::None),
            chaos_params: serde_json::from_str(&row.chaos_params_json)
                .unwrap_or(serde_json::Value::Null),
            status: TrialStatus::parse(&row.status).unwrap_or(TrialStatus::Failed),
            started_at: row.started_at,
            chaos_injected_at: row.chaos_injected_at,
            ended_at: row.ended_at,
            chaos_metadata: serde_json::from_str(&row.chaos_metadata_json)
                .unwrap_or(serde_json::Value::Null),
            final_state: serde_json::from_str(&row.final_state_json)
                .unwrap_or(serde_json::Value::Null),
            agent_session_id: row.agent_session_id,
            ticket_ids: serde_json::from_str(&row.ticket_ids_json).unwrap_or_default(),
            error: row.error,
        }
    }
}

impl CampaignStore {
    /// Wrap an already-migrated pool.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create_campaign(&self, campaign: &Campaign) -> Result<(), StoreError> {
        let config_json = serde_json::to_string(&campaign.config)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            "INSERT INTO campaigns (id, name, created_at, config_json) VALUES (?, ?, ?, ?)",
        )
        .bind(&campaign.id)
        .bind(&campaign.name)
        .bind(campaign.created_at)
        .bind(&config_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_campaign(&self, id: &str) -> Result<Campaign, StoreError> {
        let row = sqlx::query_as::<_, CampaignRow>("SELECT * FROM campaigns WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::CampaignNotFound(id.to_owned()))?;
        Ok(row.into())
    }

    /// Insert pending rows for a freshly-expanded matrix.
    pub async fn insert_trials(&self, trials: &[Trial]) -> Result<(), StoreError> {
        for trial in trials {
            self.write_trial(trial, true).await?;
        }
        Ok(())
    }

    /// Persist a trial's full current record.
    pub async fn update_trial(&self, trial: &Trial) -> Result<(), StoreError> {
        self.write_trial(trial, false).await
    }

    async fn write_trial(&self, trial: &Trial, insert: bool) -> Result<(), StoreError> {
        let encode = |v: &serde_json::Value| -> Result<String, StoreError> {
            serde_json::to_string(v).map_err(|e| StoreError::Serialization(e.to_string()))
        };
        let chaos_params = encode(&trial.chaos_params)?;
        let chaos_metadata = encode(&trial.chaos_metadata)?;
        let final_state = encode(&trial.final_state)?;
        let ticket_ids = serde_json::to_string(&trial.ticket_ids)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let sql = if insert {
            r"
            INSERT INTO trials (
                id, campaign_id, subject, chaos_type, chaos_params_json, status,
                started_at, chaos_injected_at, ended_at,
                chaos_metadata_json, final_state_json,
                agent_session_id, ticket_ids_json, error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "
        } else {
            r"
            UPDATE trials SET
                campaign_id = ?2, subject = ?3, chaos_type = ?4,
                chaos_params_json = ?5, status = ?6,
                started_at = ?7, chaos_injected_at = ?8, ended_at = ?9,
                chaos_metadata_json = ?10, final_state_json = ?11,
                agent_session_id = ?12, ticket_ids_json = ?13, error = ?14
            WHERE id = ?1
            "
        };

        let result = sqlx::query(sql)
            .bind(&trial.id)
            .bind(&trial.campaign_id)
            .bind(&trial.subject)
            .bind(trial.chaos_kind.as_str())
            .bind(&chaos_params)
            .bind(trial.status.as_str())
            .bind(trial.started_at)
            .bind(trial.chaos_injected_at)
            .bind(trial.ended_at)
            .bind(&chaos_metadata)
            .bind(&final_state)
            .bind(&trial.agent_session_id)
            .bind(&ticket_ids)
            .bind(&trial.error)
            .execute(&self.pool)
            .await?;

        if !insert && result.rows_affected() == 0 {
            return Err(StoreError::TrialNotFound(trial.id.clone()));
        }
        Ok(())
    }

    pub async fn get_trial(&self, id: &str) -> Result<Trial, StoreError> {
        let row = sqlx::query_as::<_, TrialRow>("SELECT * FROM trials WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::TrialNotFound(id.to_owned()))?;
        Ok(row.into())
    }

    /// All trials of a campaign in insertion order.
    pub async fn trials_for(&self, campaign_id: &str) -> Result<Vec<Trial>, StoreError> {
        let rows = sqlx::query_as::<_, TrialRow>(
            "SELECT * FROM trials WHERE campaign_id = ? ORDER BY rowid",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Trials a resumed campaign still has to run: `pending` rows plus
    /// `running` rows left behind by an interrupted runner.
    pub async fn resumable_trials(&self, campaign_id: &str) -> Result<Vec<Trial>, StoreError> {
        let rows = sqlx::query_as::<_, TrialRow>(
            r"
            SELECT * FROM trials
            WHERE campaign_id = ? AND status IN ('pending', 'running')
            ORDER BY rowid
            ",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::run_migrations;
    use crate::pool::connect_memory;

    use std::collections::HashMap;
    use vigil_core::{CampaignSpec, ChaosSpec};

    fn spec() -> CampaignSpec {
        CampaignSpec {
            name: "smoke".into(),
            subjects: vec!["mock".into()],
            chaos_types: vec![ChaosSpec {
                kind: ChaosKind::NodeKill,
                params: HashMap::new(),
            }],
            trials_per_combination: 2,
            parallel: 1,
            cooldown_seconds: 0,
            include_baseline: false,
        }
    }

    async fn store() -> CampaignStore {
        let pool = connect_memory().await.unwrap();
        run_migrations(&pool).await.unwrap();
        CampaignStore::new(pool)
    }

    #[tokio::test]
    async fn campaign_round_trips() {
        let store = store().await;
        let campaign = Campaign::new(&spec());
        store.create_campaign(&campaign).await.unwrap();

        let loaded = store.get_campaign(&campaign.id).await.unwrap();
        assert_eq!(loaded.name, "smoke");
        assert_eq!(loaded.config, campaign.config);
    }

    #[tokio::test]
    async fn trial_lifecycle_round_trips() {
        let store = store().await;
        let campaign = Campaign::new(&spec());
        store.create_campaign(&campaign).await.unwrap();

        let specs = spec().expand();
        let trials: Vec<Trial> = specs.iter().map(|s| Trial::pending(&campaign.id, s)).collect();
        store.insert_trials(&trials).await.unwrap();

        assert_eq!(store.resumable_trials(&campaign.id).await.unwrap().len(), 2);

        let mut running = trials[0].clone();
        running.status = TrialStatus::Running;
        running.started_at = Some(Utc::now());
        store.update_trial(&running).await.unwrap();

        let mut complete = running.clone();
        complete.status = TrialStatus::Complete;
        complete.ended_at = Some(Utc::now());
        complete.ticket_ids = vec![3, 4];
        complete.final_state = serde_json::json!({"entities": {}});
        store.update_trial(&complete).await.unwrap();

        let loaded = store.get_trial(&complete.id).await.unwrap();
        assert_eq!(loaded.status, TrialStatus::Complete);
        assert_eq!(loaded.ticket_ids, vec![3, 4]);
        assert!(loaded.ended_at.is_some());

        // Only the untouched trial remains resumable.
        let remaining = store.resumable_trials(&campaign.id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, trials[1].id);
    }

    #[tokio::test]
    async fn interrupted_running_rows_are_resumable() {
        let store = store().await;
        let campaign = Campaign::new(&spec());
        store.create_campaign(&campaign).await.unwrap();

        let specs = spec().expand();
        let mut trial = Trial::pending(&campaign.id, &specs[0]);
        store.insert_trials(std::slice::from_ref(&trial)).await.unwrap();

        trial.status = TrialStatus::Running;
        store.update_trial(&trial).await.unwrap();

        let resumable = store.resumable_trials(&campaign.id).await.unwrap();
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].status, TrialStatus::Running);
    }

    #[tokio::test]
    async fn updating_missing_trial_fails() {
        let store = store().await;
        let specs = spec().expand();
        let trial = Trial::pending("no-such-campaign", &specs[0]);
        let err = store.update_trial(&trial).await.unwrap_err();
        assert!(matches!(err, StoreError::TrialNotFound(_)));
    }
}
