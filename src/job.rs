//! The job runner: the durable driver of the deployment flow. Each
//! named step's result is journaled so a crash or restart between steps
//! replays the journal instead of re-executing a non-idempotent side effect.

use crate::cache;
use crate::checkout::PaymentProvider;
use crate::config::deadlines;
use crate::errors::OrchestratorError;
use crate::events::{self, DeploymentStarted, Event};
use crate::manifest::{self, ManifestParams};
use crate::metering;
use crate::repository::{BlacklistAdapter, DeploymentRepository, JobStepRepository, ProviderBlacklistRepository};
use crate::state_machine;
use crate::users::UserRepository;
use crate::{marketplace, retry};
use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone)]
struct DeployBotSuccess {
  dseq: String,
  lease_id: String,
  provider: String,
  service_url: Option<String>,
}

#[derive(Serialize, Deserialize, Clone)]
struct DeployBotFailure {
  error: String,
  dseq: Option<String>,
}

#[derive(Serialize, Deserialize, Clone)]
#[serde(tag = "outcome")]
enum DeployBotResult {
  Success(DeployBotSuccess),
  Failure(DeployBotFailure),
}

pub struct JobRunner {
  pub marketplace: Arc<dyn marketplace::Service>,
  pub repo: Arc<dyn DeploymentRepository>,
  pub blacklist_repo: Arc<dyn ProviderBlacklistRepository>,
  pub steps: Arc<dyn JobStepRepository>,
  pub cache: Arc<dyn cache::Service>,
  pub events: Arc<dyn events::Service>,
  pub users: Arc<dyn UserRepository>,
  pub payment: Arc<dyn PaymentProvider>,
  pub marketplace_api_key: String,
  pub deposit_usd: f64,
  pub ibc_denom: String,
  pub upstream_llm_key: String,
  in_flight: Mutex<HashSet<Uuid>>,
}

#[allow(clippy::too_many_arguments)]
impl JobRunner {
  pub fn new(
    marketplace: Arc<dyn marketplace::Service>,
    repo: Arc<dyn DeploymentRepository>,
    blacklist_repo: Arc<dyn ProviderBlacklistRepository>,
    steps: Arc<dyn JobStepRepository>,
    cache: Arc<dyn cache::Service>,
    events: Arc<dyn events::Service>,
    users: Arc<dyn UserRepository>,
    payment: Arc<dyn PaymentProvider>,
    marketplace_api_key: String,
    deposit_usd: f64,
    ibc_denom: String,
    upstream_llm_key: String,
  ) -> Arc<Self> {
    Arc::new(JobRunner {
      marketplace,
      repo,
      blacklist_repo,
      steps,
      cache,
      events,
      users,
      payment,
      marketplace_api_key,
      deposit_usd,
      ibc_denom,
      upstream_llm_key,
      in_flight: Mutex::new(HashSet::new()),
    })
  }

  /// Subscribes to the bus's own `DEPLOYMENT_STARTED` topic and spawns
  /// a single-flight run per event. This is what turns "re-emit the start
  /// event with an incremented attempt" into a scheduled retry rather than a
  /// recursive call.
  pub fn spawn_event_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
    let mut receiver = self.events.subscribe();
    tokio::spawn(async move {
      loop {
        match receiver.recv().await {
          Ok(Event::DeploymentStarted(started)) => {
            let runner = Arc::clone(&self);
            tokio::spawn(async move { runner.run(started).await });
          }
          Ok(_) => {}
          Err(broadcast::error::RecvError::Lagged(n)) => {
            warn!("job runner event loop lagged by {} events", n);
          }
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    })
  }

  /// Enforces single-flight per `deploymentId`: a second event for an id
  /// already running is dropped, not queued — the in-flight run will itself
  /// re-emit a retry event if needed.
  pub async fn run(&self, started: DeploymentStarted) {
    {
      let mut guard = self.in_flight.lock().unwrap();
      if !guard.insert(started.deployment_id) {
        info!("deployment {} already has a run in flight, dropping duplicate event", started.deployment_id);
        return;
      }
    }
    self.run_inner(&started).await;
    self.in_flight.lock().unwrap().remove(&started.deployment_id);
  }

  /// Journals under `(job_id, "attempt-{attempt}:{step_name}")` rather than
  /// bare `step_name`: a scheduled retry re-emits `DEPLOYMENT_STARTED` with
  /// an incremented `attempt` to the same runner sharing the same step
  /// repository, so without the attempt in the key, attempt 2 would replay
  /// attempt 1's journaled `deploy-bot` result (including a failure) forever
  /// instead of re-executing. Still replays its own steps on crash recovery
  /// within the same attempt.
  async fn run_step<F, Fut>(&self, job_id: Uuid, attempt: u32, step_name: &str, compute: F) -> serde_json::Value
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = serde_json::Value>,
  {
    let key = format!("attempt-{}:{}", attempt, step_name);
    if let Some(cached) = self.steps.get_step_result(job_id, &key).await {
      return cached;
    }
    let result = compute().await;
    self.steps.put_step_result(job_id, &key, result.clone()).await;
    result
  }

  async fn run_inner(&self, started: &DeploymentStarted) {
    let job_id = started.deployment_id;

    // Step 1: update-status-deploying. A plain, unguarded write: the
    // Checkout Mediator already performed the pending->deploying guard on
    // attempt 1; on a re-entrant attempt the record is already `deploying`
    // and this is a no-op write.
    self
      .run_step(job_id, started.attempt, "update-status-deploying", || async {
        self
          .repo
          .update_status(job_id, crate::domain::DeploymentStatus::Deploying, Default::default())
          .await;
        json!({ "attempt": started.attempt })
      })
      .await;

    let deploy_result_value = self
      .run_step(job_id, started.attempt, "deploy-bot", || async {
        serde_json::to_value(self.deploy_bot(started).await).unwrap()
      })
      .await;
    let deploy_result: DeployBotResult = serde_json::from_value(deploy_result_value).expect("journaled deploy-bot result is well-formed");

    match deploy_result {
      DeployBotResult::Success(success) => self.on_success(started, success).await,
      DeployBotResult::Failure(failure) => self.on_failure(started, failure).await,
    }
  }

  async fn deploy_bot(&self, started: &DeploymentStarted) -> DeployBotResult {
    let api_key = &self.marketplace_api_key;
    let gateway_token = started.gateway_token.clone().unwrap_or_default();

    let deployment = match self.repo.find_by_id(started.deployment_id).await {
      Some(d) => d,
      None => {
        return DeployBotResult::Failure(DeployBotFailure {
          error: "deployment record disappeared".to_string(),
          dseq: None,
        })
      }
    };

    let descriptor = manifest::render(&ManifestParams {
      channel_token: &started.channel_token,
      internal_api_key: &gateway_token,
      upstream_api_key: &self.upstream_llm_key,
      model_id: &deployment.model,
      ibc_denom: &self.ibc_denom,
    });

    let created = match self.marketplace.create_deployment(&descriptor, api_key, self.deposit_usd).await {
      Ok(c) => c,
      Err(e) => {
        return DeployBotResult::Failure(DeployBotFailure {
          error: e.to_string(),
          dseq: None,
        })
      }
    };

    state_machine::record_marketplace_submission(self.repo.as_ref(), started.deployment_id, created.marketplace_deployment_id.clone()).await;

    // Certificates are optional and never fail the deployment; this is
    // a best-effort internal action inside deploy-bot, not a journaled step.
    if !self.marketplace.ensure_certificate(api_key).await {
      warn!("deployment {}: proceeding without a confirmed certificate", started.deployment_id);
    }

    let bids = match self.marketplace.poll_for_bids(&created.marketplace_deployment_id, api_key).await {
      Ok(bids) => bids,
      Err(e) => {
        return DeployBotResult::Failure(DeployBotFailure {
          error: e.to_string(),
          dseq: Some(created.marketplace_deployment_id),
        })
      }
    };

    let blacklist_entries = self.blacklist_repo.list().await;
    let blacklist = BlacklistAdapter(&blacklist_entries);
    match retry::try_all_bids_until_success(
      self.marketplace.as_ref(),
      &blacklist,
      &created.manifest,
      &created.marketplace_deployment_id,
      &bids,
      api_key,
    )
    .await
    {
      Ok(outcome) => {
        let service_url = outcome.lease.service_url().map(str::to_string);
        DeployBotResult::Success(DeployBotSuccess {
          dseq: created.marketplace_deployment_id,
          lease_id: outcome.lease.marketplace_lease_id.clone(),
          provider: outcome.provider_address,
          service_url,
        })
      }
      Err(e) => DeployBotResult::Failure(DeployBotFailure {
        error: e.to_string(),
        dseq: Some(created.marketplace_deployment_id),
      }),
    }
  }

  async fn on_success(&self, started: &DeploymentStarted, success: DeployBotSuccess) {
    let job_id = started.deployment_id;
    let api_key = self.marketplace_api_key.clone();
    let current_dseq = success.dseq.clone();

    self
      .run_step(job_id, started.attempt, "cleanup-failed-deployments", || async {
        for dseq in started.failed_dseqs.iter().filter(|d| **d != current_dseq) {
          if let Err(e) = self.marketplace.close_deployment(dseq, &api_key).await {
            warn!("cleanup-failed-deployments: failed to close {}: {}", dseq, e);
          }
        }
        json!({ "closed": started.failed_dseqs })
      })
      .await;

    let current_dseq = success.dseq.clone();
    self
      .run_step(job_id, started.attempt, "cleanup-zombie-deployments", || async {
        let mut closed = Vec::new();
        if let Ok(open) = self.marketplace.list_open_deployments(&api_key).await {
          for open_deployment in open {
            if open_deployment.dseq == current_dseq {
              continue;
            }
            let age = Utc::now().signed_duration_since(open_deployment.created_at).to_std().unwrap_or_default();
            if age > deadlines::ZOMBIE_GRACE {
              match self.marketplace.close_deployment(&open_deployment.dseq, &api_key).await {
                Ok(()) => closed.push(open_deployment.dseq),
                Err(e) => warn!("cleanup-zombie-deployments: failed to close {}: {}", open_deployment.dseq, e),
              }
            }
          }
        }
        json!({ "closed": closed })
      })
      .await;

    state_machine::mark_active(
      self.repo.as_ref(),
      self.cache.as_ref(),
      self.events.as_ref(),
      job_id,
      success.lease_id,
      success.service_url,
    )
    .await;

    self
      .run_step(job_id, started.attempt, "send-completed-event", || async { json!({}) })
      .await;

    // Best-effort billing signal that the bot started; never gates
    // the deployment's outcome, which is already committed above.
    if let Some(deployment) = self.repo.find_by_id(job_id).await {
      if let Some(user) = self.users.find_by_id(deployment.user_id).await {
        if let Some(billing_customer_id) = user.billing_customer_id {
          let result = metering::record_usage_safe(
            self.payment.as_ref(),
            self.cache.as_ref(),
            &billing_customer_id,
            "deployment.active",
            1.0,
            true,
          )
          .await;
          if let Some(error) = result.error {
            warn!("usage metering for deployment {} did not record: {}", job_id, error);
          }
        }
      }
    }
  }

  async fn on_failure(&self, started: &DeploymentStarted, failure: DeployBotFailure) {
    let job_id = started.deployment_id;
    let mut failed_dseqs = started.failed_dseqs.clone();
    if let Some(dseq) = &failure.dseq {
      if !failed_dseqs.contains(dseq) {
        failed_dseqs.push(dseq.clone());
      }
    }

    if started.attempt < deadlines::MAX_JOB_ATTEMPTS {
      let message = format!("Attempt {} failed: {}", started.attempt, failure.error);
      state_machine::schedule_retry(
        self.repo.as_ref(),
        self.events.as_ref(),
        job_id,
        started.channel_token.clone(),
        message,
        started.attempt + 1,
        failed_dseqs,
      )
      .await;
    } else {
      let message = format!("All {} attempts failed: {}", deadlines::MAX_JOB_ATTEMPTS, failure.error);
      state_machine::mark_failed(self.repo.as_ref(), self.cache.as_ref(), self.events.as_ref(), job_id, message).await;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::NoopCache;
  use crate::domain::{DeploymentStatus, NewDeployment};
  use crate::repository::{InMemoryDeploymentRepository, InMemoryJobStepRepository, InMemoryProviderBlacklist};
  use crate::testing::{bid, FakeMarketplace};

  fn new_started(deployment_id: Uuid, channel_token: &str, attempt: u32, failed_dseqs: Vec<String>) -> DeploymentStarted {
    DeploymentStarted {
      deployment_id,
      channel_token: channel_token.to_string(),
      gateway_token: Some("gw-token".to_string()),
      attempt,
      failed_dseqs,
    }
  }

  fn runner(marketplace: Arc<FakeMarketplace>, repo: Arc<InMemoryDeploymentRepository>, events: Arc<dyn events::Service>) -> Arc<JobRunner> {
    JobRunner::new(
      marketplace,
      repo,
      Arc::new(InMemoryProviderBlacklist::new(Vec::new())),
      Arc::new(InMemoryJobStepRepository::new()),
      Arc::new(NoopCache),
      events,
      Arc::new(crate::users::InMemoryUserRepository::new()),
      Arc::new(crate::checkout::InMemoryPaymentProvider::new()),
      "operator-key".to_string(),
      10.0,
      "ibc/test".to_string(),
      "upstream-key".to_string(),
    )
  }

  #[tokio::test]
  async fn e1_happy_path_picks_the_cheaper_bid() {
    let marketplace = Arc::new(FakeMarketplace::new());
    marketplace.set_bids(vec![bid("P1", "1000"), bid("P2", "500")]);
    let repo = Arc::new(InMemoryDeploymentRepository::new());
    let events: Arc<dyn events::Service> = Arc::new(events::new_service());
    let deployment = repo
      .create(NewDeployment {
        user_id: Uuid::new_v4(),
        model: "gpt-4o-mini".to_string(),
        channel: "telegram".to_string(),
        channel_token_encrypted: "enc".to_string(),
        channel_token_fingerprint: "fp".to_string(),
        llm_api_key_encrypted: "enc".to_string(),
      })
      .await;

    let runner = runner(marketplace, repo.clone(), events.clone());
    runner.run(new_started(deployment.id, "tok", 1, Vec::new())).await;

    let updated = repo.find_by_id(deployment.id).await.unwrap();
    assert_eq!(updated.status, DeploymentStatus::Active);
    assert!(updated.provider_url.unwrap().contains("P2"));
  }

  #[tokio::test]
  async fn e2_failover_skips_a_provider_that_exhausts_its_retries() {
    let marketplace = Arc::new(FakeMarketplace::new());
    marketplace.set_bids(vec![bid("P2", "500"), bid("P3", "750"), bid("P1", "1000")]);
    marketplace.script_lease(
      "P2",
      vec![Err(OrchestratorError::ExternalProtocol {
        status: 503,
        body: "unavailable".to_string(),
      })],
    );
    let repo = Arc::new(InMemoryDeploymentRepository::new());
    let events: Arc<dyn events::Service> = Arc::new(events::new_service());
    let deployment = repo
      .create(NewDeployment {
        user_id: Uuid::new_v4(),
        model: "gpt-4o-mini".to_string(),
        channel: "telegram".to_string(),
        channel_token_encrypted: "enc".to_string(),
        channel_token_fingerprint: "fp".to_string(),
        llm_api_key_encrypted: "enc".to_string(),
      })
      .await;

    let runner = runner(marketplace, repo.clone(), events.clone());
    runner.run(new_started(deployment.id, "tok", 1, Vec::new())).await;

    let updated = repo.find_by_id(deployment.id).await.unwrap();
    assert_eq!(updated.status, DeploymentStatus::Active);
    assert!(updated.provider_url.unwrap().contains("P3"));
  }

  #[tokio::test]
  async fn e3_cross_attempt_cleanup_closes_the_prior_attempts_dseq() {
    let marketplace = Arc::new(FakeMarketplace::new());
    marketplace.set_bids(vec![bid("P1", "500")]);
    let repo = Arc::new(InMemoryDeploymentRepository::new());
    let events: Arc<dyn events::Service> = Arc::new(events::new_service());
    let deployment = repo
      .create(NewDeployment {
        user_id: Uuid::new_v4(),
        model: "gpt-4o-mini".to_string(),
        channel: "telegram".to_string(),
        channel_token_encrypted: "enc".to_string(),
        channel_token_fingerprint: "fp".to_string(),
        llm_api_key_encrypted: "enc".to_string(),
      })
      .await;

    let runner = runner(marketplace.clone(), repo.clone(), events.clone());
    // Simulate attempt 2, carrying forward a dseq from a failed attempt 1.
    runner
      .run(new_started(deployment.id, "tok", 2, vec!["dseq-stale".to_string()]))
      .await;

    let updated = repo.find_by_id(deployment.id).await.unwrap();
    assert_eq!(updated.status, DeploymentStatus::Active);
    assert_eq!(marketplace.closed_dseqs(), vec!["dseq-stale".to_string()]);
  }

  #[tokio::test]
  async fn e4_exhaustion_fails_after_max_attempts() {
    let marketplace = Arc::new(FakeMarketplace::new());
    marketplace.set_bids(vec![bid("P1", "500")]);
    marketplace.script_lease(
      "P1",
      vec![Err(OrchestratorError::ExternalProtocol {
        status: 503,
        body: "unavailable".to_string(),
      })],
    );
    let repo = Arc::new(InMemoryDeploymentRepository::new());
    let events: Arc<dyn events::Service> = Arc::new(events::new_service());
    let deployment = repo
      .create(NewDeployment {
        user_id: Uuid::new_v4(),
        model: "gpt-4o-mini".to_string(),
        channel: "telegram".to_string(),
        channel_token_encrypted: "enc".to_string(),
        channel_token_fingerprint: "fp".to_string(),
        llm_api_key_encrypted: "enc".to_string(),
      })
      .await;

    let runner = runner(marketplace, repo.clone(), events.clone());
    runner.run(new_started(deployment.id, "tok", deadlines::MAX_JOB_ATTEMPTS, Vec::new())).await;

    let updated = repo.find_by_id(deployment.id).await.unwrap();
    assert_eq!(updated.status, DeploymentStatus::Failed);
    assert!(updated.error_message.unwrap().starts_with("All 3 attempts failed:"));
  }

  /// The step journal is shared by every attempt against a job, since a
  /// scheduled retry re-emits `DEPLOYMENT_STARTED` to the same runner. Absent
  /// an attempt-scoped key, attempt 2 would find attempt 1's journaled
  /// `deploy-bot` failure and replay it forever instead of re-running.
  #[tokio::test]
  async fn cross_attempt_retry_re_runs_deploy_bot_instead_of_replaying_the_prior_attempts_failure() {
    let marketplace = Arc::new(FakeMarketplace::new());
    marketplace.set_bids(vec![bid("P1", "500")]);
    marketplace.script_lease(
      "P1",
      vec![
        Err(OrchestratorError::ExternalProtocol {
          status: 503,
          body: "unavailable".to_string(),
        }),
        Ok(crate::domain::Lease {
          provider_address: "P1".to_string(),
          marketplace_lease_id: "lease-retry".to_string(),
          services: [("openclaw".to_string(), vec!["https://p1.example/bot".to_string()])]
            .into_iter()
            .collect(),
        }),
      ],
    );
    let repo = Arc::new(InMemoryDeploymentRepository::new());
    let events: Arc<dyn events::Service> = Arc::new(events::new_service());
    let deployment = repo
      .create(NewDeployment {
        user_id: Uuid::new_v4(),
        model: "gpt-4o-mini".to_string(),
        channel: "telegram".to_string(),
        channel_token_encrypted: "enc".to_string(),
        channel_token_fingerprint: "fp".to_string(),
        llm_api_key_encrypted: "enc".to_string(),
      })
      .await;

    let runner = runner(marketplace, repo.clone(), events.clone());
    runner.run(new_started(deployment.id, "tok", 1, Vec::new())).await;
    let after_attempt_1 = repo.find_by_id(deployment.id).await.unwrap();
    assert_eq!(after_attempt_1.status, DeploymentStatus::Deploying);
    let dseq_attempt_1 = after_attempt_1.marketplace_deployment_id.clone().unwrap();

    runner.run(new_started(deployment.id, "tok", 2, vec![dseq_attempt_1.clone()])).await;
    let after_attempt_2 = repo.find_by_id(deployment.id).await.unwrap();
    assert_eq!(after_attempt_2.status, DeploymentStatus::Active);
    assert_ne!(after_attempt_2.marketplace_deployment_id.unwrap(), dseq_attempt_1);
  }
}
