//! The deployment repository and the job runner's step journal: CRUD,
//! indexed queries, and atomic status transitions, each with an in-memory
//! implementation for tests/single-process operation and a Postgres one
//! sharing a connection pool so a step write and its guarded deployment
//! write commit together.

use crate::domain::{BlacklistedProvider, Deployment, DeploymentStatus, DeploymentStatusDetails, NewDeployment};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[async_trait]
pub trait DeploymentRepository: Send + Sync + 'static {
  async fn create(&self, input: NewDeployment) -> Deployment;
  async fn find_by_id(&self, id: Uuid) -> Option<Deployment>;
  async fn find_by_user_id(&self, user_id: Uuid) -> Vec<Deployment>;

  /// The DB-only half of finding a pending duplicate: the most recent
  /// `pending` record for the tuple, with no opinion on whether its
  /// checkout session is still open upstream — that check belongs to the
  /// duplicate-request guard, which is the only caller that also holds
  /// a payment-provider handle (see DESIGN.md). Matched on the deterministic
  /// `channel_token_fingerprint`, never on `channel_token_encrypted`: AEAD
  /// encryption uses a fresh random IV per call, so two encryptions of the
  /// same token never compare equal.
  async fn find_pending_duplicate_candidate(
    &self,
    user_id: Uuid,
    model: &str,
    channel: &str,
    channel_token_fingerprint: &str,
  ) -> Option<Deployment>;

  async fn update_status(&self, id: Uuid, status: DeploymentStatus, details: DeploymentStatusDetails) -> Option<Deployment>;

  /// Binds a freshly created payment-provider checkout session id onto a
  /// still-unbound pending record. Kept distinct from
  /// `update_status` because it neither changes `status` nor any field that
  /// transition guards reason about.
  async fn bind_checkout_session(&self, id: Uuid, checkout_session_id: String) -> Option<Deployment>;
}

#[async_trait]
pub trait ProviderBlacklistRepository: Send + Sync + 'static {
  async fn list(&self) -> Vec<BlacklistedProvider>;
}

/// Adapts a resolved blacklist snapshot to the `retry::Blacklist` view the
/// retry engine consumes synchronously. Callers fetch the snapshot with one
/// `list().await` and hand the result here, rather than bridging an async
/// repository call from inside the engine's sync filter.
pub struct BlacklistAdapter<'a>(pub &'a [BlacklistedProvider]);

impl<'a> crate::retry::Blacklist for BlacklistAdapter<'a> {
  fn is_blacklisted(&self, provider_address: &str) -> bool {
    self.0.iter().any(|b| b.provider_address == provider_address)
  }
}

#[async_trait]
pub trait JobStepRepository: Send + Sync + 'static {
  /// Returns the journaled result of a step if it already ran for this job,
  /// so the Job Runner can skip re-executing its (non-idempotent) body.
  async fn get_step_result(&self, job_id: Uuid, step_name: &str) -> Option<serde_json::Value>;
  async fn put_step_result(&self, job_id: Uuid, step_name: &str, result: serde_json::Value);
}

// ---------------------------------------------------------------------------
// In-memory implementation: used by tests and by a process with no
// `DATABASE_URL` configured.
// ---------------------------------------------------------------------------

pub struct InMemoryDeploymentRepository {
  rows: Mutex<HashMap<Uuid, Deployment>>,
}

impl InMemoryDeploymentRepository {
  pub fn new() -> Self {
    InMemoryDeploymentRepository { rows: Mutex::new(HashMap::new()) }
  }
}

impl Default for InMemoryDeploymentRepository {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl DeploymentRepository for InMemoryDeploymentRepository {
  async fn create(&self, input: NewDeployment) -> Deployment {
    let now = Utc::now();
    let deployment = Deployment {
      id: Uuid::new_v4(),
      user_id: input.user_id,
      model: input.model,
      channel: input.channel,
      channel_token_encrypted: input.channel_token_encrypted,
      channel_token_fingerprint: input.channel_token_fingerprint,
      llm_api_key_encrypted: input.llm_api_key_encrypted,
      status: DeploymentStatus::Pending,
      checkout_session_id: None,
      marketplace_deployment_id: None,
      marketplace_lease_id: None,
      provider_url: None,
      error_message: None,
      internal_api_key: Uuid::new_v4(),
      created_at: now,
      updated_at: now,
    };
    self.rows.lock().unwrap().insert(deployment.id, deployment.clone());
    deployment
  }

  async fn find_by_id(&self, id: Uuid) -> Option<Deployment> {
    self.rows.lock().unwrap().get(&id).cloned()
  }

  async fn find_by_user_id(&self, user_id: Uuid) -> Vec<Deployment> {
    let mut rows: Vec<Deployment> = self
      .rows
      .lock()
      .unwrap()
      .values()
      .filter(|d| d.user_id == user_id)
      .cloned()
      .collect();
    rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    rows
  }

  async fn find_pending_duplicate_candidate(
    &self,
    user_id: Uuid,
    model: &str,
    channel: &str,
    channel_token_fingerprint: &str,
  ) -> Option<Deployment> {
    let mut candidates: Vec<Deployment> = self
      .rows
      .lock()
      .unwrap()
      .values()
      .filter(|d| {
        d.user_id == user_id
          && d.model == model
          && d.channel == channel
          && d.channel_token_fingerprint == channel_token_fingerprint
          && d.status == DeploymentStatus::Pending
          && d.checkout_session_id.is_some()
      })
      .cloned()
      .collect();
    candidates.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    candidates.into_iter().next()
  }

  async fn update_status(&self, id: Uuid, status: DeploymentStatus, details: DeploymentStatusDetails) -> Option<Deployment> {
    let mut guard = self.rows.lock().unwrap();
    let deployment = guard.get_mut(&id)?;
    // Once terminal, the status itself never changes again, though
    // observational fields still may. The state machine already enforces
    // this at a higher level via guards; this is a second check at the
    // storage boundary.
    if !deployment.status.is_terminal() {
      deployment.status = status;
    }
    if let Some(v) = details.marketplace_deployment_id {
      deployment.marketplace_deployment_id = Some(v);
    }
    if let Some(v) = details.marketplace_lease_id {
      deployment.marketplace_lease_id = Some(v);
    }
    if let Some(v) = details.provider_url {
      deployment.provider_url = Some(v);
    }
    if let Some(v) = details.error_message {
      deployment.error_message = Some(v);
    }
    deployment.updated_at = Utc::now();
    Some(deployment.clone())
  }

  async fn bind_checkout_session(&self, id: Uuid, checkout_session_id: String) -> Option<Deployment> {
    let mut guard = self.rows.lock().unwrap();
    let deployment = guard.get_mut(&id)?;
    deployment.checkout_session_id = Some(checkout_session_id);
    deployment.updated_at = Utc::now();
    Some(deployment.clone())
  }
}

pub struct InMemoryProviderBlacklist {
  entries: Mutex<Vec<BlacklistedProvider>>,
}

impl InMemoryProviderBlacklist {
  pub fn new(entries: Vec<BlacklistedProvider>) -> Self {
    InMemoryProviderBlacklist { entries: Mutex::new(entries) }
  }
}

#[async_trait]
impl ProviderBlacklistRepository for InMemoryProviderBlacklist {
  async fn list(&self) -> Vec<BlacklistedProvider> {
    self.entries.lock().unwrap().clone()
  }
}

pub struct InMemoryJobStepRepository {
  steps: Mutex<HashMap<(Uuid, String), serde_json::Value>>,
}

impl InMemoryJobStepRepository {
  pub fn new() -> Self {
    InMemoryJobStepRepository { steps: Mutex::new(HashMap::new()) }
  }
}

impl Default for InMemoryJobStepRepository {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl JobStepRepository for InMemoryJobStepRepository {
  async fn get_step_result(&self, job_id: Uuid, step_name: &str) -> Option<serde_json::Value> {
    self.steps.lock().unwrap().get(&(job_id, step_name.to_string())).cloned()
  }

  async fn put_step_result(&self, job_id: Uuid, step_name: &str, result: serde_json::Value) {
    self
      .steps
      .lock()
      .unwrap()
      .insert((job_id, step_name.to_string()), result);
  }
}

// ---------------------------------------------------------------------------
// Postgres-backed implementation, selected when `DATABASE_URL` is set.
// ---------------------------------------------------------------------------

pub mod postgres {
  use super::*;
  use sqlx::PgPool;
  use sqlx::Row;

  pub struct PostgresDeploymentRepository {
    pool: PgPool,
  }

  impl PostgresDeploymentRepository {
    pub fn new(pool: PgPool) -> Self {
      PostgresDeploymentRepository { pool }
    }
  }

  fn row_to_status(s: &str) -> DeploymentStatus {
    match s {
      "deploying" => DeploymentStatus::Deploying,
      "active" => DeploymentStatus::Active,
      "failed" => DeploymentStatus::Failed,
      _ => DeploymentStatus::Pending,
    }
  }

  #[async_trait]
  impl DeploymentRepository for PostgresDeploymentRepository {
    async fn create(&self, input: NewDeployment) -> Deployment {
      let id = Uuid::new_v4();
      let internal_api_key = Uuid::new_v4();
      let row = sqlx::query(
        r#"
        INSERT INTO deployments
          (id, user_id, model, channel, channel_token_encrypted, channel_token_fingerprint,
           llm_api_key_encrypted, status, internal_api_key, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8, now(), now())
        RETURNING created_at, updated_at
        "#,
      )
      .bind(id)
      .bind(input.user_id)
      .bind(&input.model)
      .bind(&input.channel)
      .bind(&input.channel_token_encrypted)
      .bind(&input.channel_token_fingerprint)
      .bind(&input.llm_api_key_encrypted)
      .bind(internal_api_key)
      .fetch_one(&self.pool)
      .await
      .expect("insert into deployments");

      Deployment {
        id,
        user_id: input.user_id,
        model: input.model,
        channel: input.channel,
        channel_token_encrypted: input.channel_token_encrypted,
        channel_token_fingerprint: input.channel_token_fingerprint,
        llm_api_key_encrypted: input.llm_api_key_encrypted,
        status: DeploymentStatus::Pending,
        checkout_session_id: None,
        marketplace_deployment_id: None,
        marketplace_lease_id: None,
        provider_url: None,
        error_message: None,
        internal_api_key,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
      }
    }

    async fn find_by_id(&self, id: Uuid) -> Option<Deployment> {
      sqlx::query(
        r#"SELECT id, user_id, model, channel, channel_token_encrypted, channel_token_fingerprint,
                  llm_api_key_encrypted, status,
                  checkout_session_id, marketplace_deployment_id, marketplace_lease_id, provider_url,
                  error_message, internal_api_key, created_at, updated_at
           FROM deployments WHERE id = $1"#,
      )
      .bind(id)
      .fetch_optional(&self.pool)
      .await
      .ok()
      .flatten()
      .map(|row| Deployment {
        id: row.get("id"),
        user_id: row.get("user_id"),
        model: row.get("model"),
        channel: row.get("channel"),
        channel_token_encrypted: row.get("channel_token_encrypted"),
        channel_token_fingerprint: row.get("channel_token_fingerprint"),
        llm_api_key_encrypted: row.get("llm_api_key_encrypted"),
        status: row_to_status(row.get::<String, _>("status").as_str()),
        checkout_session_id: row.get("checkout_session_id"),
        marketplace_deployment_id: row.get("marketplace_deployment_id"),
        marketplace_lease_id: row.get("marketplace_lease_id"),
        provider_url: row.get("provider_url"),
        error_message: row.get("error_message"),
        internal_api_key: row.get("internal_api_key"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
      })
    }

    async fn find_by_user_id(&self, user_id: Uuid) -> Vec<Deployment> {
      let ids = sqlx::query("SELECT id FROM deployments WHERE user_id = $1 ORDER BY created_at DESC")
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .unwrap_or_default();
      let mut out = Vec::with_capacity(ids.len());
      for row in ids {
        if let Some(d) = self.find_by_id(row.get("id")).await {
          out.push(d);
        }
      }
      out
    }

    async fn find_pending_duplicate_candidate(
      &self,
      user_id: Uuid,
      model: &str,
      channel: &str,
      channel_token_fingerprint: &str,
    ) -> Option<Deployment> {
      let id: Option<Uuid> = sqlx::query(
        r#"SELECT id FROM deployments
           WHERE user_id = $1 AND model = $2 AND channel = $3 AND channel_token_fingerprint = $4
             AND status = 'pending' AND checkout_session_id IS NOT NULL
           ORDER BY created_at DESC LIMIT 1"#,
      )
      .bind(user_id)
      .bind(model)
      .bind(channel)
      .bind(channel_token_fingerprint)
      .fetch_optional(&self.pool)
      .await
      .ok()
      .flatten()
      .map(|row| row.get("id"));

      match id {
        Some(id) => self.find_by_id(id).await,
        None => None,
      }
    }

    async fn update_status(
      &self,
      id: Uuid,
      status: DeploymentStatus,
      details: DeploymentStatusDetails,
    ) -> Option<Deployment> {
      sqlx::query(
        r#"
        UPDATE deployments SET
          status = CASE WHEN status IN ('active', 'failed') THEN status ELSE $2 END,
          marketplace_deployment_id = COALESCE($3, marketplace_deployment_id),
          marketplace_lease_id = COALESCE($4, marketplace_lease_id),
          provider_url = COALESCE($5, provider_url),
          error_message = COALESCE($6, error_message),
          updated_at = now()
        WHERE id = $1
        "#,
      )
      .bind(id)
      .bind(status.as_str())
      .bind(details.marketplace_deployment_id)
      .bind(details.marketplace_lease_id)
      .bind(details.provider_url)
      .bind(details.error_message)
      .execute(&self.pool)
      .await
      .ok()?;

      self.find_by_id(id).await
    }

    async fn bind_checkout_session(&self, id: Uuid, checkout_session_id: String) -> Option<Deployment> {
      sqlx::query("UPDATE deployments SET checkout_session_id = $2, updated_at = now() WHERE id = $1")
        .bind(id)
        .bind(checkout_session_id)
        .execute(&self.pool)
        .await
        .ok()?;
      self.find_by_id(id).await
    }
  }

  pub struct PostgresProviderBlacklistRepository {
    pool: PgPool,
  }

  impl PostgresProviderBlacklistRepository {
    pub fn new(pool: PgPool) -> Self {
      PostgresProviderBlacklistRepository { pool }
    }
  }

  #[async_trait]
  impl ProviderBlacklistRepository for PostgresProviderBlacklistRepository {
    async fn list(&self) -> Vec<BlacklistedProvider> {
      sqlx::query("SELECT provider_address FROM provider_blacklist")
        .fetch_all(&self.pool)
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|row| BlacklistedProvider {
          provider_address: row.get("provider_address"),
        })
        .collect()
    }
  }

  pub struct PostgresJobStepRepository {
    pool: PgPool,
  }

  impl PostgresJobStepRepository {
    pub fn new(pool: PgPool) -> Self {
      PostgresJobStepRepository { pool }
    }
  }

  #[async_trait]
  impl JobStepRepository for PostgresJobStepRepository {
    async fn get_step_result(&self, job_id: Uuid, step_name: &str) -> Option<serde_json::Value> {
      sqlx::query("SELECT result FROM job_steps WHERE job_id = $1 AND step_name = $2")
        .bind(job_id)
        .bind(step_name)
        .fetch_optional(&self.pool)
        .await
        .ok()
        .flatten()
        .map(|row| row.get("result"))
    }

    async fn put_step_result(&self, job_id: Uuid, step_name: &str, result: serde_json::Value) {
      let _ = sqlx::query(
        r#"INSERT INTO job_steps (job_id, step_name, result, created_at)
           VALUES ($1, $2, $3, now())
           ON CONFLICT (job_id, step_name) DO UPDATE SET result = EXCLUDED.result"#,
      )
      .bind(job_id)
      .bind(step_name)
      .bind(result)
      .execute(&self.pool)
      .await;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::retry::Blacklist;

  fn new_input() -> NewDeployment {
    NewDeployment {
      user_id: Uuid::new_v4(),
      model: "gpt-4o-mini".to_string(),
      channel: "telegram".to_string(),
      channel_token_encrypted: "iv:ct:tag".to_string(),
      channel_token_fingerprint: "fp-1".to_string(),
      llm_api_key_encrypted: "iv:ct:tag".to_string(),
    }
  }

  #[tokio::test]
  async fn create_then_find_by_id_roundtrips() {
    let repo = InMemoryDeploymentRepository::new();
    let created = repo.create(new_input()).await;
    let found = repo.find_by_id(created.id).await.unwrap();
    assert_eq!(found.id, created.id);
    assert_eq!(found.status, DeploymentStatus::Pending);
  }

  #[tokio::test]
  async fn update_status_never_overwrites_a_terminal_status() {
    let repo = InMemoryDeploymentRepository::new();
    let created = repo.create(new_input()).await;
    repo
      .update_status(
        created.id,
        DeploymentStatus::Failed,
        DeploymentStatusDetails {
          error_message: Some("boom".to_string()),
          ..Default::default()
        },
      )
      .await;
    let after_first = repo.find_by_id(created.id).await.unwrap();
    assert_eq!(after_first.status, DeploymentStatus::Failed);

    repo
      .update_status(created.id, DeploymentStatus::Active, DeploymentStatusDetails::default())
      .await;
    let after_second = repo.find_by_id(created.id).await.unwrap();
    assert_eq!(after_second.status, DeploymentStatus::Failed);
  }

  #[tokio::test]
  async fn find_pending_duplicate_candidate_matches_the_full_tuple() {
    let repo = InMemoryDeploymentRepository::new();
    let input = new_input();
    let created = repo.create(input.clone()).await;
    repo.bind_checkout_session(created.id, "cs_123".to_string()).await;

    let found = repo
      .find_pending_duplicate_candidate(input.user_id, &input.model, &input.channel, &input.channel_token_fingerprint)
      .await;
    assert_eq!(found.unwrap().id, created.id);

    let none = repo
      .find_pending_duplicate_candidate(input.user_id, "different-model", &input.channel, &input.channel_token_fingerprint)
      .await;
    assert!(none.is_none());
  }

  #[tokio::test]
  async fn blacklist_adapter_checks_membership() {
    let repo = InMemoryProviderBlacklist::new(vec![BlacklistedProvider {
      provider_address: "akash1badprovider".to_string(),
    }]);
    let entries = repo.list().await;
    let adapter = BlacklistAdapter(&entries);
    assert!(adapter.is_blacklisted("akash1badprovider"));
    assert!(!adapter.is_blacklisted("akash1goodprovider"));
  }
}
