//! The boundary against the payment provider, and the at-most-one-pending-
//! checkout-per-tuple rule that guards against duplicate requests.

use crate::config::PaymentConfig;
use crate::crypto;
use crate::domain::{DeploymentStatus, NewDeployment, User};
use crate::errors::OrchestratorError;
use crate::repository::DeploymentRepository;
use crate::state_machine;
use crate::{cache, events};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use log::warn;
use serde_json::json;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

pub struct CreateCheckoutParams {
  pub email: String,
  pub deployment_id: Uuid,
  pub success_url: String,
  pub customer_id: Option<String>,
  pub product_id: String,
  pub metadata: HashMap<String, String>,
}

#[derive(Clone, Debug)]
pub struct CheckoutSession {
  pub id: String,
  pub url: String,
  pub open: bool,
}

/// The payment provider, treated as an external collaborator: a
/// checkout-session factory plus the usage-ingestion surface the metering
/// bridge drives.
#[async_trait]
pub trait PaymentProvider: Send + Sync + 'static {
  async fn create_checkout_session(&self, params: CreateCheckoutParams) -> Result<CheckoutSession, OrchestratorError>;
  async fn get_checkout_session(&self, session_id: &str) -> Result<Option<CheckoutSession>, OrchestratorError>;
  async fn ingest_usage_event(&self, customer_id: &str, event_name: &str, amount: f64) -> Result<(), OrchestratorError>;
  async fn meter_exists(&self, customer_id: &str, meter_name: &str) -> Result<bool, OrchestratorError>;
}

pub struct HttpPaymentProvider {
  base_url: url::Url,
  access_token: String,
  client: reqwest::Client,
}

impl HttpPaymentProvider {
  pub fn new(config: &PaymentConfig) -> Self {
    let base = if config.sandbox {
      "https://sandbox.payments.example/v1"
    } else {
      "https://api.payments.example/v1"
    };
    HttpPaymentProvider {
      base_url: url::Url::parse(base).expect("fixed base url"),
      access_token: config.access_token.clone(),
      client: reqwest::Client::new(),
    }
  }
}

#[async_trait]
impl PaymentProvider for HttpPaymentProvider {
  async fn create_checkout_session(&self, params: CreateCheckoutParams) -> Result<CheckoutSession, OrchestratorError> {
    let url = self.base_url.join("checkout/sessions").expect("fixed path");
    let response = self
      .client
      .post(url)
      .bearer_auth(&self.access_token)
      .json(&json!({
        "customerEmail": params.email,
        "customerId": params.customer_id,
        "productId": params.product_id,
        "successUrl": params.success_url,
        "metadata": params.metadata,
      }))
      .send()
      .await
      .map_err(|e| OrchestratorError::Transport {
        operation: "createCheckoutSession".to_string(),
        cause: e.to_string(),
      })?;

    if !response.status().is_success() {
      let status = response.status();
      let body = response.text().await.unwrap_or_default();
      return Err(OrchestratorError::ExternalProtocol {
        status: status.as_u16(),
        body,
      });
    }

    let body: serde_json::Value = response
      .json()
      .await
      .map_err(|e| OrchestratorError::ExternalMalformed(e.to_string()))?;
    let id = body
      .get("id")
      .and_then(|v| v.as_str())
      .ok_or_else(|| OrchestratorError::ExternalMalformed("checkout session missing id".to_string()))?;
    let session_url = body
      .get("url")
      .and_then(|v| v.as_str())
      .ok_or_else(|| OrchestratorError::ExternalMalformed("checkout session missing url".to_string()))?;

    Ok(CheckoutSession {
      id: id.to_string(),
      url: session_url.to_string(),
      open: true,
    })
  }

  async fn get_checkout_session(&self, session_id: &str) -> Result<Option<CheckoutSession>, OrchestratorError> {
    let url = self
      .base_url
      .join(&format!("checkout/sessions/{}", session_id))
      .expect("fixed path");
    let response = self
      .client
      .get(url)
      .bearer_auth(&self.access_token)
      .send()
      .await
      .map_err(|e| OrchestratorError::Transport {
        operation: "getCheckoutSession".to_string(),
        cause: e.to_string(),
      })?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
      return Ok(None);
    }
    if !response.status().is_success() {
      let status = response.status();
      let body = response.text().await.unwrap_or_default();
      return Err(OrchestratorError::ExternalProtocol {
        status: status.as_u16(),
        body,
      });
    }

    let body: serde_json::Value = response
      .json()
      .await
      .map_err(|e| OrchestratorError::ExternalMalformed(e.to_string()))?;
    let id = body.get("id").and_then(|v| v.as_str()).unwrap_or(session_id).to_string();
    let url = body.get("url").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let status = body.get("status").and_then(|v| v.as_str()).unwrap_or("");

    Ok(Some(CheckoutSession {
      id,
      url,
      open: status == "open",
    }))
  }

  async fn ingest_usage_event(&self, customer_id: &str, event_name: &str, amount: f64) -> Result<(), OrchestratorError> {
    let url = self.base_url.join("usage/events").expect("fixed path");
    let response = self
      .client
      .post(url)
      .bearer_auth(&self.access_token)
      .json(&json!({
        "customerId": customer_id,
        "name": event_name,
        "metadata": { "amount": amount },
        "timestamp": chrono::Utc::now().to_rfc3339(),
      }))
      .send()
      .await
      .map_err(|e| OrchestratorError::Transport {
        operation: "ingestUsageEvent".to_string(),
        cause: e.to_string(),
      })?;

    if response.status().is_success() {
      Ok(())
    } else {
      let status = response.status();
      let body = response.text().await.unwrap_or_default();
      Err(OrchestratorError::ExternalProtocol {
        status: status.as_u16(),
        body,
      })
    }
  }

  async fn meter_exists(&self, customer_id: &str, meter_name: &str) -> Result<bool, OrchestratorError> {
    let url = self
      .base_url
      .join(&format!("customers/{}/meters/{}", customer_id, meter_name))
      .expect("fixed path");
    let response = self
      .client
      .get(url)
      .bearer_auth(&self.access_token)
      .send()
      .await
      .map_err(|e| OrchestratorError::Transport {
        operation: "meterExists".to_string(),
        cause: e.to_string(),
      })?;
    Ok(response.status().is_success())
  }
}

/// In-memory fake: scripted "open" bit per session, used by tests.
pub struct InMemoryPaymentProvider {
  sessions: Mutex<HashMap<String, CheckoutSession>>,
  meters: Mutex<HashMap<String, Vec<String>>>,
}

impl InMemoryPaymentProvider {
  pub fn new() -> Self {
    InMemoryPaymentProvider {
      sessions: Mutex::new(HashMap::new()),
      meters: Mutex::new(HashMap::new()),
    }
  }

  pub fn seed_meter(&self, customer_id: &str, meter_name: &str) {
    self
      .meters
      .lock()
      .unwrap()
      .entry(customer_id.to_string())
      .or_default()
      .push(meter_name.to_string());
  }

  /// Test hook: flips a previously created session's `open` bit, simulating
  /// the payment provider closing/expiring it out of band.
  pub fn close_session(&self, session_id: &str) {
    if let Some(session) = self.sessions.lock().unwrap().get_mut(session_id) {
      session.open = false;
    }
  }
}

impl Default for InMemoryPaymentProvider {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl PaymentProvider for InMemoryPaymentProvider {
  async fn create_checkout_session(&self, params: CreateCheckoutParams) -> Result<CheckoutSession, OrchestratorError> {
    let id = format!("cs_{}", Uuid::new_v4());
    let session = CheckoutSession {
      id: id.clone(),
      url: format!("{}?session_id={}", params.success_url, id),
      open: true,
    };
    self.sessions.lock().unwrap().insert(id, session.clone());
    Ok(session)
  }

  async fn get_checkout_session(&self, session_id: &str) -> Result<Option<CheckoutSession>, OrchestratorError> {
    Ok(self.sessions.lock().unwrap().get(session_id).cloned())
  }

  async fn ingest_usage_event(&self, _customer_id: &str, _event_name: &str, _amount: f64) -> Result<(), OrchestratorError> {
    Ok(())
  }

  async fn meter_exists(&self, customer_id: &str, meter_name: &str) -> Result<bool, OrchestratorError> {
    Ok(self
      .meters
      .lock()
      .unwrap()
      .get(customer_id)
      .map(|names| names.iter().any(|n| n == meter_name))
      .unwrap_or(false))
  }
}

pub struct CheckoutResult {
  pub session_url: String,
  pub deployment_id: Uuid,
}

/// Creates a checkout session, reusing a still-open pending checkout for the
/// same tuple instead of creating a second deployment.
#[allow(clippy::too_many_arguments)]
pub async fn create_or_reuse_checkout(
  repo: &dyn DeploymentRepository,
  payment: &dyn PaymentProvider,
  crypto: &dyn crypto::Service,
  user: &User,
  model: String,
  channel: String,
  channel_token: &str,
  upstream_llm_key: &str,
  product_id: &str,
  success_url: &str,
) -> Result<CheckoutResult, OrchestratorError> {
  let channel_token_encrypted = crypto.encrypt(channel_token);
  let channel_token_fingerprint = crypto.fingerprint(channel_token);

  if let Some(candidate) = repo
    .find_pending_duplicate_candidate(user.id, &model, &channel, &channel_token_fingerprint)
    .await
  {
    if let Some(session_id) = candidate.checkout_session_id.clone() {
      match payment.get_checkout_session(&session_id).await {
        Ok(Some(session)) if session.open => {
          return Ok(CheckoutResult {
            session_url: session.url,
            deployment_id: candidate.id,
          });
        }
        Ok(_) => {}
        Err(e) => warn!("checkout session lookup failed, falling through to a new checkout: {}", e),
      }
    }
  }

  let deployment = repo
    .create(NewDeployment {
      user_id: user.id,
      model,
      channel,
      channel_token_encrypted,
      channel_token_fingerprint,
      llm_api_key_encrypted: crypto.encrypt(upstream_llm_key),
    })
    .await;

  let mut metadata = HashMap::new();
  metadata.insert("deploymentId".to_string(), deployment.id.to_string());

  let session = payment
    .create_checkout_session(CreateCheckoutParams {
      email: user.email.clone(),
      deployment_id: deployment.id,
      success_url: success_url.to_string(),
      customer_id: user.billing_customer_id.clone(),
      product_id: product_id.to_string(),
      metadata,
    })
    .await?;

  repo.bind_checkout_session(deployment.id, session.id.clone()).await;

  Ok(CheckoutResult {
    session_url: session.url,
    deployment_id: deployment.id,
  })
}

/// Verifies the `webhook-signature` header against an HMAC-SHA256 of the raw
/// body keyed by `PAYMENT_WEBHOOK_SECRET`. Constant-time by construction
/// (`Mac::verify_slice`), since this guards the only unauthenticated
/// endpoint.
pub fn verify_webhook_signature(secret: &str, payload: &[u8], signature_hex: &str) -> bool {
  let signature = match hex::decode(signature_hex) {
    Ok(bytes) => bytes,
    Err(_) => return false,
  };
  let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
    Ok(mac) => mac,
    Err(_) => return false,
  };
  mac.update(payload);
  mac.verify_slice(&signature).is_ok()
}

/// Handles a `checkout.completed` event: resolves the deployment via
/// `metadata.deploymentId` and starts the job runner by transitioning it to
/// `deploying`. A replayed event finds a non-`pending` record and is a
/// no-op.
pub async fn handle_checkout_completed(
  repo: &dyn DeploymentRepository,
  cache: &dyn cache::Service,
  events: &dyn events::Service,
  crypto: &dyn crypto::Service,
  deployment_id: Uuid,
) -> Result<(), OrchestratorError> {
  let deployment = match repo.find_by_id(deployment_id).await {
    Some(d) => d,
    None => return Ok(()), // unknown deployment id; nothing to do
  };
  if deployment.status != DeploymentStatus::Pending {
    return Ok(());
  }

  let channel_token = crypto
    .decrypt(&deployment.channel_token_encrypted)
    .map_err(|_| OrchestratorError::invalid_argument("stored channel token is unreadable"))?;

  state_machine::start_deploying(repo, cache, events, deployment_id, channel_token).await;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::NoopCache;
  use crate::crypto as crypto_mod;
  use crate::events;
  use crate::repository::InMemoryDeploymentRepository;

  fn user() -> User {
    User {
      id: Uuid::new_v4(),
      external_auth_id: Some("auth0|x".to_string()),
      email: "a@example.com".to_string(),
      billing_customer_id: None,
      created_at: chrono::Utc::now(),
    }
  }

  #[tokio::test]
  async fn second_checkout_for_the_same_tuple_reuses_the_open_session() {
    let repo = InMemoryDeploymentRepository::new();
    let payment = InMemoryPaymentProvider::new();
    let crypto = crypto_mod::new_service([3u8; 32]);
    let u = user();

    let first = create_or_reuse_checkout(
      &repo,
      &payment,
      &crypto,
      &u,
      "gpt-4o-mini".to_string(),
      "telegram".to_string(),
      "bot-token",
      "upstream-key",
      "prod_1",
      "https://app.example/success",
    )
    .await
    .unwrap();

    let second = create_or_reuse_checkout(
      &repo,
      &payment,
      &crypto,
      &u,
      "gpt-4o-mini".to_string(),
      "telegram".to_string(),
      "bot-token",
      "upstream-key",
      "prod_1",
      "https://app.example/success",
    )
    .await
    .unwrap();

    assert_eq!(first.deployment_id, second.deployment_id);
    assert_eq!(first.session_url, second.session_url);
    assert_eq!(repo.find_by_user_id(u.id).await.len(), 1);
  }

  #[tokio::test]
  async fn a_closed_session_does_not_block_a_new_checkout() {
    let repo = InMemoryDeploymentRepository::new();
    let payment = InMemoryPaymentProvider::new();
    let crypto = crypto_mod::new_service([3u8; 32]);
    let u = user();

    let first = create_or_reuse_checkout(
      &repo,
      &payment,
      &crypto,
      &u,
      "gpt-4o-mini".to_string(),
      "telegram".to_string(),
      "bot-token",
      "upstream-key",
      "prod_1",
      "https://app.example/success",
    )
    .await
    .unwrap();

    let first_deployment = repo.find_by_id(first.deployment_id).await.unwrap();
    payment.close_session(first_deployment.checkout_session_id.as_ref().unwrap());

    let second = create_or_reuse_checkout(
      &repo,
      &payment,
      &crypto,
      &u,
      "gpt-4o-mini".to_string(),
      "telegram".to_string(),
      "bot-token",
      "upstream-key",
      "prod_1",
      "https://app.example/success",
    )
    .await
    .unwrap();

    assert_ne!(first.deployment_id, second.deployment_id);
    assert_eq!(repo.find_by_user_id(u.id).await.len(), 2);
  }

  #[test]
  fn webhook_signature_round_trips() {
    let secret = "whsec_test";
    let payload = br#"{"type":"checkout.completed"}"#;
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(payload);
    let signature = hex::encode(mac.finalize().into_bytes());

    assert!(verify_webhook_signature(secret, payload, &signature));
    assert!(!verify_webhook_signature(secret, payload, &hex::encode([0u8; 32])));
    assert!(!verify_webhook_signature("wrong-secret", payload, &signature));
  }

  #[tokio::test]
  async fn replayed_webhook_after_deploying_started_is_a_no_op() {
    let repo = InMemoryDeploymentRepository::new();
    let cache = NoopCache;
    let events = events::new_service();
    let crypto = crypto_mod::new_service([9u8; 32]);

    let deployment = repo
      .create(NewDeployment {
        user_id: Uuid::new_v4(),
        model: "gpt-4o-mini".to_string(),
        channel: "telegram".to_string(),
        channel_token_encrypted: crypto.encrypt("bot-token"),
        channel_token_fingerprint: crypto.fingerprint("bot-token"),
        llm_api_key_encrypted: crypto.encrypt("upstream-key"),
      })
      .await;

    handle_checkout_completed(&repo, &cache, &events, &crypto, deployment.id)
      .await
      .unwrap();
    let after_first = repo.find_by_id(deployment.id).await.unwrap();
    assert_eq!(after_first.status, DeploymentStatus::Deploying);

    handle_checkout_completed(&repo, &cache, &events, &crypto, deployment.id)
      .await
      .unwrap();
    let after_second = repo.find_by_id(deployment.id).await.unwrap();
    assert_eq!(after_second.status, DeploymentStatus::Deploying);
  }
}
