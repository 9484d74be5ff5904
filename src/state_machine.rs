//! The deployment state machine: the sole writer of persisted `Deployment`
//! fields. Every transition here is the only place `status` changes, cache
//! invalidation happens, and the three bus events are emitted.

use crate::cache;
use crate::domain::{Deployment, DeploymentStatus, DeploymentStatusDetails};
use crate::events::{self, DeploymentCompleted, DeploymentFailed, DeploymentStarted, Event};
use crate::repository::DeploymentRepository;
use uuid::Uuid;

/// `pending -> deploying`, guarded on the current status so a replayed
/// webhook or a duplicate start is a no-op rather than a double-run.
pub async fn start_deploying(
  repo: &dyn DeploymentRepository,
  cache: &dyn cache::Service,
  events: &dyn events::Service,
  deployment_id: Uuid,
  channel_token: String,
) -> Option<Deployment> {
  let current = repo.find_by_id(deployment_id).await?;
  if current.status != DeploymentStatus::Pending {
    return None;
  }

  let updated = repo
    .update_status(deployment_id, DeploymentStatus::Deploying, DeploymentStatusDetails::default())
    .await?;
  cache.delete(&cache::deployments_key(&updated.user_id)).await;
  events.publish(Event::DeploymentStarted(DeploymentStarted {
    deployment_id,
    channel_token,
    gateway_token: Some(updated.internal_api_key.to_string()),
    attempt: 1,
    failed_dseqs: Vec::new(),
  }));
  Some(updated)
}

/// Re-emits `DEPLOYMENT_STARTED` with an incremented attempt counter and the
/// dseqs accumulated so far, modeling "schedule a new attempt" without the
/// runner ever throwing.
pub async fn schedule_retry(
  repo: &dyn DeploymentRepository,
  events: &dyn events::Service,
  deployment_id: Uuid,
  channel_token: String,
  attempt_error_message: String,
  next_attempt: u32,
  failed_dseqs: Vec<String>,
) -> Option<Deployment> {
  let updated = repo
    .update_status(
      deployment_id,
      DeploymentStatus::Deploying,
      DeploymentStatusDetails {
        error_message: Some(attempt_error_message),
        ..Default::default()
      },
    )
    .await?;
  events.publish(Event::DeploymentStarted(DeploymentStarted {
    deployment_id,
    channel_token,
    gateway_token: Some(updated.internal_api_key.to_string()),
    attempt: next_attempt,
    failed_dseqs,
  }));
  Some(updated)
}

/// Stays `deploying`; records the dseq assigned by a successful marketplace
/// submission. Not a status change, so no cache invalidation or event is
/// fired.
pub async fn record_marketplace_submission(
  repo: &dyn DeploymentRepository,
  deployment_id: Uuid,
  marketplace_deployment_id: String,
) -> Option<Deployment> {
  repo
    .update_status(
      deployment_id,
      DeploymentStatus::Deploying,
      DeploymentStatusDetails {
        marketplace_deployment_id: Some(marketplace_deployment_id),
        ..Default::default()
      },
    )
    .await
}

/// `deploying -> active`.
pub async fn mark_active(
  repo: &dyn DeploymentRepository,
  cache: &dyn cache::Service,
  events: &dyn events::Service,
  deployment_id: Uuid,
  marketplace_lease_id: String,
  provider_url: Option<String>,
) -> Option<Deployment> {
  let updated = repo
    .update_status(
      deployment_id,
      DeploymentStatus::Active,
      DeploymentStatusDetails {
        marketplace_lease_id: Some(marketplace_lease_id),
        provider_url,
        ..Default::default()
      },
    )
    .await?;
  cache.delete(&cache::deployments_key(&updated.user_id)).await;
  events.publish(Event::DeploymentCompleted(DeploymentCompleted { deployment_id }));
  Some(updated)
}

/// `deploying -> failed`, terminal.
pub async fn mark_failed(
  repo: &dyn DeploymentRepository,
  cache: &dyn cache::Service,
  events: &dyn events::Service,
  deployment_id: Uuid,
  error_message: String,
) -> Option<Deployment> {
  let updated = repo
    .update_status(
      deployment_id,
      DeploymentStatus::Failed,
      DeploymentStatusDetails {
        error_message: Some(error_message.clone()),
        ..Default::default()
      },
    )
    .await?;
  cache.delete(&cache::deployments_key(&updated.user_id)).await;
  events.publish(Event::DeploymentFailed(DeploymentFailed {
    deployment_id,
    error: error_message,
  }));
  Some(updated)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::NoopCache;
  use crate::domain::NewDeployment;
  use crate::repository::InMemoryDeploymentRepository;

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
  async fn start_deploying_is_a_no_op_replay_on_non_pending() {
    let repo = InMemoryDeploymentRepository::new();
    let cache = NoopCache;
    let events = events::new_service();
    let deployment = repo.create(new_input()).await;

    let first = start_deploying(&repo, &cache, &events, deployment.id, "tok".to_string()).await;
    assert!(first.is_some());
    assert_eq!(first.unwrap().status, DeploymentStatus::Deploying);

    let second = start_deploying(&repo, &cache, &events, deployment.id, "tok".to_string()).await;
    assert!(second.is_none());
  }

  #[tokio::test]
  async fn mark_active_emits_completed_and_mark_failed_emits_failed() {
    let repo = InMemoryDeploymentRepository::new();
    let cache = NoopCache;
    let events = events::new_service();
    let mut receiver = events.subscribe();
    let deployment = repo.create(new_input()).await;
    start_deploying(&repo, &cache, &events, deployment.id, "tok".to_string()).await;
    let _ = receiver.try_recv();

    let updated = mark_active(
      &repo,
      &cache,
      &events,
      deployment.id,
      "lease-1".to_string(),
      Some("https://x.example/bot".to_string()),
    )
    .await
    .unwrap();
    assert_eq!(updated.status, DeploymentStatus::Active);
    assert!(matches!(receiver.try_recv().unwrap(), Event::DeploymentCompleted(_)));

    let other = repo.create(new_input()).await;
    start_deploying(&repo, &cache, &events, other.id, "tok".to_string()).await;
    let mut receiver2 = events.subscribe();
    let failed = mark_failed(&repo, &cache, &events, other.id, "all providers failed".to_string())
      .await
      .unwrap();
    assert_eq!(failed.status, DeploymentStatus::Failed);
    assert!(matches!(receiver2.try_recv().unwrap(), Event::DeploymentFailed(_)));
  }
}
