//! The HTTP ingress: the three endpoints, each gated by the rate limiter
//! before any work happens, and translating every `OrchestratorError` into a
//! generic, technical-detail-free body on a 5xx.

use crate::checkout::{self, CheckoutResult};
use crate::context::Context;
use crate::domain::DeploymentStatus;
use crate::errors::{self, OrchestratorError};
use crate::users;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

const CHECKOUT_LIMIT: u32 = 10;
const CHECKOUT_WINDOW: Duration = Duration::from_secs(60);
const STATUS_LIMIT: u32 = 60;
const STATUS_WINDOW: Duration = Duration::from_secs(60);
const WEBHOOK_LIMIT: u32 = 120;
const WEBHOOK_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct CheckoutRequest {
  model: String,
  channel: String,
  #[serde(rename = "channelToken")]
  channel_token: String,
  #[allow(dead_code)]
  tier: Option<String>,
}

#[derive(Debug, Serialize)]
struct CheckoutResponse {
  #[serde(rename = "sessionUrl")]
  session_url: String,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
  status: &'static str,
  #[serde(skip_serializing_if = "Option::is_none")]
  channel: Option<String>,
  #[serde(rename = "channelLink", skip_serializing_if = "Option::is_none")]
  channel_link: Option<String>,
  #[serde(rename = "providerUrl", skip_serializing_if = "Option::is_none")]
  provider_url: Option<String>,
  #[serde(rename = "marketplaceDeploymentId", skip_serializing_if = "Option::is_none")]
  marketplace_deployment_id: Option<String>,
  #[serde(rename = "marketplaceLeaseId", skip_serializing_if = "Option::is_none")]
  marketplace_lease_id: Option<String>,
  #[serde(rename = "errorMessage", skip_serializing_if = "Option::is_none")]
  error_message: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
  error: &'static str,
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
  id: Option<String>,
}

fn error_reply(err: &OrchestratorError) -> warp::reply::WithStatus<warp::reply::Json> {
  let status = StatusCode::from_u16(errors::http_status_for(err)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
  warp::reply::with_status(warp::reply::json(&ErrorResponse { error: err.user_message() }), status)
}

/// Every route authenticates the same way: a bearer token naming the caller
/// (treated as the upstream auth provider's opaque subject id, the way a
/// reverse-proxy / auth gateway would attach it) plus a companion header
/// carrying the claimed email, since nothing upstream of this service is in
/// scope here.
fn authenticate(auth_header: Option<String>, email_header: Option<String>) -> Result<(String, String), OrchestratorError> {
  let token = auth_header
    .as_deref()
    .and_then(|h| h.strip_prefix("Bearer "))
    .filter(|t| !t.is_empty())
    .ok_or(OrchestratorError::Unauthorized)?;
  let email = email_header.filter(|e| !e.is_empty()).ok_or(OrchestratorError::Unauthorized)?;
  Ok((token.to_string(), email))
}

async fn handle_checkout(
  ctx: Arc<Context>,
  auth_header: Option<String>,
  email_header: Option<String>,
  body: CheckoutRequest,
) -> Result<impl Reply, Infallible> {
  let (external_auth_id, email) = match authenticate(auth_header, email_header) {
    Ok(v) => v,
    Err(e) => return Ok(error_reply(&e)),
  };

  let admission = ctx.ratelimit.admit(&format!("checkout:{}", external_auth_id), CHECKOUT_LIMIT, CHECKOUT_WINDOW);
  if !admission.allowed {
    return Ok(warp::reply::with_status(
      warp::reply::json(&ErrorResponse { error: "rate limit exceeded" }),
      StatusCode::TOO_MANY_REQUESTS,
    ));
  }

  if body.model.trim().is_empty() || body.channel.trim().is_empty() || body.channel_token.trim().is_empty() {
    return Ok(error_reply(&OrchestratorError::invalid_argument(
      "model, channel, and channelToken are all required",
    )));
  }

  let user = users::resolve_user(ctx.users.as_ref(), &external_auth_id, &email).await;

  let result: Result<CheckoutResult, OrchestratorError> = checkout::create_or_reuse_checkout(
    ctx.repo.as_ref(),
    ctx.payment.as_ref(),
    ctx.crypto.as_ref(),
    &user,
    body.model,
    body.channel,
    &body.channel_token,
    &ctx.config.upstream_llm_key,
    &ctx.config.payment.product_id,
    &ctx.checkout_success_url,
  )
  .await;

  match result {
    Ok(checkout) => Ok(warp::reply::with_status(
      warp::reply::json(&CheckoutResponse { session_url: checkout.session_url }),
      StatusCode::OK,
    )),
    Err(e) => {
      warn!("checkout creation failed for user {}: {}", user.id, e);
      Ok(error_reply(&e))
    }
  }
}

async fn handle_webhook(ctx: Arc<Context>, signature: Option<String>, body: bytes::Bytes) -> Result<impl Reply, Infallible> {
  let admission = ctx.ratelimit.admit("webhook:payment", WEBHOOK_LIMIT, WEBHOOK_WINDOW);
  if !admission.allowed {
    return Ok(warp::reply::with_status(
      warp::reply::json(&ErrorResponse { error: "rate limit exceeded" }),
      StatusCode::TOO_MANY_REQUESTS,
    ));
  }

  let signature = match signature {
    Some(s) => s,
    None => return Ok(error_reply(&OrchestratorError::Unauthorized)),
  };
  if !checkout::verify_webhook_signature(&ctx.config.payment.webhook_secret, &body, &signature) {
    return Ok(error_reply(&OrchestratorError::Unauthorized));
  }

  let payload: serde_json::Value = match serde_json::from_slice(&body) {
    Ok(v) => v,
    Err(_) => return Ok(error_reply(&OrchestratorError::invalid_argument("malformed webhook body"))),
  };

  let event_type = payload.get("type").and_then(|v| v.as_str()).unwrap_or("");
  if event_type == "checkout.completed" {
    let deployment_id = payload
      .get("data")
      .and_then(|d| d.get("metadata"))
      .and_then(|m| m.get("deploymentId"))
      .and_then(|v| v.as_str())
      .and_then(|s| Uuid::parse_str(s).ok());

    match deployment_id {
      Some(id) => {
        if let Err(e) = checkout::handle_checkout_completed(ctx.repo.as_ref(), ctx.cache.as_ref(), ctx.events.as_ref(), ctx.crypto.as_ref(), id).await
        {
          warn!("checkout.completed handling failed for deployment {}: {}", id, e);
        }
      }
      None => warn!("checkout.completed webhook carried no usable metadata.deploymentId"),
    }
  } else {
    info!("ignoring unhandled webhook event type {:?}", event_type);
  }

  Ok(warp::reply::with_status(warp::reply::json(&serde_json::json!({"ok": true})), StatusCode::OK))
}

async fn handle_status(
  ctx: Arc<Context>,
  auth_header: Option<String>,
  email_header: Option<String>,
  query: StatusQuery,
) -> Result<impl Reply, Infallible> {
  let (external_auth_id, email) = match authenticate(auth_header, email_header) {
    Ok(v) => v,
    Err(e) => return Ok(error_reply(&e)),
  };

  let admission = ctx.ratelimit.admit(&format!("status:{}", external_auth_id), STATUS_LIMIT, STATUS_WINDOW);
  if !admission.allowed {
    return Ok(warp::reply::with_status(
      warp::reply::json(&ErrorResponse { error: "rate limit exceeded" }),
      StatusCode::TOO_MANY_REQUESTS,
    ));
  }

  let id = match query.id.as_deref().map(Uuid::parse_str) {
    Some(Ok(id)) => id,
    _ => return Ok(error_reply(&OrchestratorError::invalid_argument("id is required and must be a UUID"))),
  };

  let user = users::resolve_user(ctx.users.as_ref(), &external_auth_id, &email).await;

  let deployment = match ctx.repo.find_by_id(id).await {
    Some(d) if d.user_id == user.id => d,
    // Unknown id and "exists but belongs to someone else" are indistinguishable to the caller.
    _ => {
      return Ok(warp::reply::with_status(
        warp::reply::json(&ErrorResponse { error: "not found" }),
        StatusCode::NOT_FOUND,
      ))
    }
  };

  let channel_link = match (deployment.channel.as_str(), deployment.provider_url.as_ref()) {
    ("telegram", Some(url)) => Some(url.clone()),
    _ => None,
  };

  let status = match deployment.status {
    DeploymentStatus::Pending => "pending",
    DeploymentStatus::Deploying => "deploying",
    DeploymentStatus::Active => "active",
    DeploymentStatus::Failed => "failed",
  };

  Ok(warp::reply::with_status(
    warp::reply::json(&StatusResponse {
      status,
      channel: Some(deployment.channel),
      channel_link,
      provider_url: deployment.provider_url,
      marketplace_deployment_id: deployment.marketplace_deployment_id,
      marketplace_lease_id: deployment.marketplace_lease_id,
      error_message: deployment.error_message,
    }),
    StatusCode::OK,
  ))
}

fn with_context(ctx: Arc<Context>) -> impl Filter<Extract = (Arc<Context>,), Error = Infallible> + Clone {
  warp::any().map(move || ctx.clone())
}

/// All three ingress routes, composed for `warp::serve`.
pub fn routes(ctx: Arc<Context>) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
  let checkout = warp::path("checkout")
    .and(warp::path::end())
    .and(warp::post())
    .and(with_context(ctx.clone()))
    .and(warp::header::optional::<String>("authorization"))
    .and(warp::header::optional::<String>("x-user-email"))
    .and(warp::body::content_length_limit(64 * 1024))
    .and(warp::body::json())
    .and_then(handle_checkout);

  let webhook = warp::path!("webhook" / "payment")
    .and(warp::post())
    .and(with_context(ctx.clone()))
    .and(warp::header::optional::<String>("webhook-signature"))
    .and(warp::body::content_length_limit(256 * 1024))
    .and(warp::body::bytes())
    .and_then(handle_webhook);

  let status = warp::path("status")
    .and(warp::path::end())
    .and(warp::get())
    .and(with_context(ctx))
    .and(warp::header::optional::<String>("authorization"))
    .and(warp::header::optional::<String>("x-user-email"))
    .and(warp::query::<StatusQuery>())
    .and_then(handle_status);

  checkout.or(webhook).or(status)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::NoopCache;
  use crate::checkout::InMemoryPaymentProvider;
  use crate::crypto;
  use crate::events;
  use crate::marketplace;
  use crate::ratelimit;
  use crate::repository::{InMemoryDeploymentRepository, InMemoryJobStepRepository, InMemoryProviderBlacklist};
  use crate::testing::FakeMarketplace;
  use crate::users::InMemoryUserRepository;
  use warp::http::StatusCode;
  use warp::test::request;

  fn test_context() -> Arc<Context> {
    let marketplace: Arc<dyn marketplace::Service> = Arc::new(FakeMarketplace::new());
    let repo: Arc<dyn crate::repository::DeploymentRepository> = Arc::new(InMemoryDeploymentRepository::new());
    let blacklist_repo: Arc<dyn crate::repository::ProviderBlacklistRepository> = Arc::new(InMemoryProviderBlacklist::new(Vec::new()));
    let steps: Arc<dyn crate::repository::JobStepRepository> = Arc::new(InMemoryJobStepRepository::new());
    let cache: Arc<dyn crate::cache::Service> = Arc::new(NoopCache);
    let events: Arc<dyn events::Service> = Arc::new(events::new_service());
    let users: Arc<dyn crate::users::UserRepository> = Arc::new(InMemoryUserRepository::new());
    let payment: Arc<dyn crate::checkout::PaymentProvider> = Arc::new(InMemoryPaymentProvider::new());
    let job_runner = crate::job::JobRunner::new(
      marketplace.clone(),
      repo.clone(),
      blacklist_repo,
      steps,
      cache.clone(),
      events.clone(),
      users.clone(),
      payment.clone(),
      "mp-key".to_string(),
      10.0,
      "uakt".to_string(),
      "upstream-key".to_string(),
    );
    Arc::new(Context {
      repo,
      users,
      payment,
      crypto: Arc::new(crypto::new_service([7u8; 32])),
      cache,
      events,
      ratelimit: Arc::new(ratelimit::new_service()),
      marketplace,
      job_runner,
      checkout_success_url: "https://app.example/success".to_string(),
      config: crate::context::test_config(),
    })
  }

  #[tokio::test]
  async fn checkout_without_auth_is_unauthorized() {
    let ctx = test_context();
    let reply = request()
      .method("POST")
      .path("/checkout")
      .json(&serde_json::json!({"model": "gpt-4o-mini", "channel": "telegram", "channelToken": "tok"}))
      .reply(&routes(ctx))
      .await;
    assert_eq!(reply.status(), StatusCode::UNAUTHORIZED);
  }

  #[tokio::test]
  async fn checkout_with_missing_fields_is_bad_request() {
    let ctx = test_context();
    let reply = request()
      .method("POST")
      .path("/checkout")
      .header("authorization", "Bearer auth0|abc")
      .header("x-user-email", "a@example.com")
      .json(&serde_json::json!({"model": "", "channel": "telegram", "channelToken": "tok"}))
      .reply(&routes(ctx))
      .await;
    assert_eq!(reply.status(), StatusCode::BAD_REQUEST);
  }

  #[tokio::test]
  async fn checkout_happy_path_returns_a_session_url() {
    let ctx = test_context();
    let reply = request()
      .method("POST")
      .path("/checkout")
      .header("authorization", "Bearer auth0|abc")
      .header("x-user-email", "a@example.com")
      .json(&serde_json::json!({"model": "gpt-4o-mini", "channel": "telegram", "channelToken": "tok"}))
      .reply(&routes(ctx))
      .await;
    assert_eq!(reply.status(), StatusCode::OK);
    let body: CheckoutResponse = serde_json::from_slice(reply.body()).unwrap();
    assert!(body.session_url.contains("session_id="));
  }

  #[tokio::test]
  async fn status_requires_a_well_formed_uuid() {
    let ctx = test_context();
    let reply = request()
      .method("GET")
      .path("/status?id=not-a-uuid")
      .header("authorization", "Bearer auth0|abc")
      .header("x-user-email", "a@example.com")
      .reply(&routes(ctx))
      .await;
    assert_eq!(reply.status(), StatusCode::BAD_REQUEST);
  }

  #[tokio::test]
  async fn status_for_an_unknown_id_is_not_found() {
    let ctx = test_context();
    let reply = request()
      .method("GET")
      .path(&format!("/status?id={}", Uuid::new_v4()))
      .header("authorization", "Bearer auth0|abc")
      .header("x-user-email", "a@example.com")
      .reply(&routes(ctx))
      .await;
    assert_eq!(reply.status(), StatusCode::NOT_FOUND);
  }

  #[tokio::test]
  async fn webhook_with_a_bad_signature_is_unauthorized() {
    let ctx = test_context();
    let reply = request()
      .method("POST")
      .path("/webhook/payment")
      .header("webhook-signature", "00")
      .body(r#"{"type":"checkout.completed"}"#)
      .reply(&routes(ctx))
      .await;
    assert_eq!(reply.status(), StatusCode::UNAUTHORIZED);
  }

  #[tokio::test]
  async fn webhook_with_a_valid_signature_for_an_unknown_event_is_acknowledged() {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let ctx = test_context();
    let payload = br#"{"type":"some.other.event"}"#;
    let mut mac = Hmac::<Sha256>::new_from_slice(ctx.config.payment.webhook_secret.as_bytes()).unwrap();
    mac.update(payload);
    let signature = hex::encode(mac.finalize().into_bytes());

    let reply = request()
      .method("POST")
      .path("/webhook/payment")
      .header("webhook-signature", signature)
      .body(payload.to_vec())
      .reply(&routes(ctx))
      .await;
    assert_eq!(reply.status(), StatusCode::OK);
  }
}
