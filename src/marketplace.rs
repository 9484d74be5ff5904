//! The marketplace client and health probe: all HTTP egress against the
//! decentralized compute marketplace. Every operation carries the deadline
//! its ceiling in `config::deadlines` specifies; retry classification is
//! delegated to `OrchestratorError::is_retryable`.

use crate::config::deadlines;
use crate::domain::{Bid, Lease};
use crate::errors::OrchestratorError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

pub struct CreatedDeployment {
  pub marketplace_deployment_id: String,
  pub manifest: String,
}

pub struct ProviderDetails {
  pub uri: String,
  pub status: String,
}

pub struct Certificate {
  pub id: String,
  pub state: String,
}

pub struct OpenDeployment {
  pub dseq: String,
  pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait Service: Send + Sync + 'static {
  async fn create_deployment(
    &self,
    descriptor: &str,
    api_key: &str,
    deposit_usd: f64,
  ) -> Result<CreatedDeployment, OrchestratorError>;

  async fn poll_for_bids(&self, marketplace_deployment_id: &str, api_key: &str) -> Result<Vec<Bid>, OrchestratorError>;

  async fn create_lease(
    &self,
    manifest: &str,
    marketplace_deployment_id: &str,
    bid: &Bid,
    api_key: &str,
  ) -> Result<Lease, OrchestratorError>;

  async fn get_provider_details(
    &self,
    provider_address: &str,
    api_key: &str,
  ) -> Result<Option<ProviderDetails>, OrchestratorError>;

  async fn check_provider_health(&self, uri: &str) -> bool;

  async fn list_certificates(&self, api_key: &str) -> Result<Option<Vec<Certificate>>, OrchestratorError>;

  /// Certificates are optional: this never surfaces an error to the
  /// caller, it returns `true` for any best-effort outcome and logs the rest.
  async fn ensure_certificate(&self, api_key: &str) -> bool;

  async fn close_deployment(&self, marketplace_deployment_id: &str, api_key: &str) -> Result<(), OrchestratorError>;

  async fn list_open_deployments(&self, api_key: &str) -> Result<Vec<OpenDeployment>, OrchestratorError>;
}

pub fn new_service(base_url: Url) -> impl Service {
  Implementation {
    base_url,
    client: reqwest::Client::new(),
  }
}

struct Implementation {
  base_url: Url,
  client: reqwest::Client,
}

/// Retries `f` with exponential backoff (base 2s, factor 2) while
/// `OrchestratorError::is_retryable` holds, up to `max_attempts` total calls.
async fn with_retries<T, F, Fut>(max_attempts: u32, operation: &str, mut f: F) -> Result<T, OrchestratorError>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, OrchestratorError>>,
{
  let mut delay = deadlines::RETRY_BASE;
  let mut attempt = 1;
  loop {
    match f().await {
      Ok(v) => return Ok(v),
      Err(e) if attempt < max_attempts && e.is_retryable() => {
        warn!(
          "retryable error on attempt {}/{} of {}: {}",
          attempt, max_attempts, operation, e
        );
        tokio::time::sleep(delay).await;
        delay = Duration::from_secs_f64(delay.as_secs_f64() * deadlines::RETRY_FACTOR);
        attempt += 1;
      }
      Err(e) => return Err(e),
    }
  }
}

fn classify_status(status: reqwest::StatusCode, body: String) -> OrchestratorError {
  match status.as_u16() {
    401 | 403 => OrchestratorError::Unauthorized,
    code => OrchestratorError::ExternalProtocol { status: code, body },
  }
}

#[derive(Deserialize)]
struct CreateDeploymentResponse {
  dseq: Option<String>,
  manifest: Option<String>,
}

#[derive(Deserialize)]
struct BidsResponse {
  #[serde(default)]
  bids: Vec<Bid>,
}

#[derive(Deserialize)]
struct LeaseResponse {
  #[serde(rename = "leaseId")]
  lease_id: Option<String>,
  #[serde(default)]
  services: BTreeMap<String, Vec<String>>,
}

#[derive(Deserialize)]
struct ProviderResponse {
  uri: Option<String>,
  status: Option<String>,
}

#[derive(Deserialize)]
struct CertificatesResponse {
  #[serde(default)]
  certificates: Vec<CertificateWire>,
}

#[derive(Deserialize)]
struct CertificateWire {
  id: String,
  state: String,
}

#[derive(Deserialize)]
struct OpenDeploymentWire {
  dseq: String,
  #[serde(rename = "createdAt")]
  created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct OpenDeploymentsResponse {
  #[serde(default)]
  deployments: Vec<OpenDeploymentWire>,
}

#[async_trait]
impl Service for Implementation {
  async fn create_deployment(
    &self,
    descriptor: &str,
    api_key: &str,
    deposit_usd: f64,
  ) -> Result<CreatedDeployment, OrchestratorError> {
    if deposit_usd < deadlines::MIN_DEPOSIT_USD {
      return Err(OrchestratorError::invalid_argument(format!(
        "deposit must be at least {} USD",
        deadlines::MIN_DEPOSIT_USD
      )));
    }

    let url = self.base_url.join("/v1/deployments").expect("fixed path");
    with_retries(deadlines::RETRY_MAX_ATTEMPTS, "createDeployment", || async {
      let response = self
        .client
        .post(url.clone())
        .bearer_auth(api_key)
        .timeout(deadlines::CREATE_DEPLOYMENT)
        .json(&json!({ "manifest": descriptor, "deposit": deposit_usd }))
        .send()
        .await
        .map_err(|e| OrchestratorError::Transport {
          operation: "createDeployment".to_string(),
          cause: e.to_string(),
        })?;

      let status = response.status();
      if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(status, body));
      }

      let parsed: CreateDeploymentResponse = response
        .json()
        .await
        .map_err(|e| OrchestratorError::ExternalMalformed(e.to_string()))?;

      match (parsed.dseq, parsed.manifest) {
        (Some(dseq), Some(manifest)) => Ok(CreatedDeployment {
          marketplace_deployment_id: dseq,
          manifest,
        }),
        _ => Err(OrchestratorError::ExternalMalformed(
          "response missing dseq or manifest".to_string(),
        )),
      }
    })
    .await
  }

  async fn poll_for_bids(&self, marketplace_deployment_id: &str, api_key: &str) -> Result<Vec<Bid>, OrchestratorError> {
    let mut url = self.base_url.join("/v1/bids").expect("fixed path");
    url.query_pairs_mut().append_pair("dseq", marketplace_deployment_id);

    let deadline = Instant::now() + deadlines::BID_POLL_TOTAL;
    for attempt in 1..=deadlines::BID_POLL_MAX_ATTEMPTS {
      if Instant::now() >= deadline {
        break;
      }

      match self
        .client
        .get(url.clone())
        .bearer_auth(api_key)
        .timeout(deadlines::BID_POLL_INTERVAL)
        .send()
        .await
      {
        Ok(response) if response.status().is_success() => match response.json::<BidsResponse>().await {
          Ok(parsed) if !parsed.bids.is_empty() => return Ok(parsed.bids),
          Ok(_) => {}
          Err(e) => warn!("bid poll attempt {}: malformed response: {}", attempt, e),
        },
        Ok(response) => warn!("bid poll attempt {}: status {}", attempt, response.status()),
        Err(e) => warn!("bid poll attempt {}: transport error: {}", attempt, e),
      }

      tokio::time::sleep(deadlines::BID_POLL_INTERVAL).await;
    }

    Err(OrchestratorError::Timeout {
      operation: "pollForBids".to_string(),
    })
  }

  async fn create_lease(
    &self,
    manifest: &str,
    marketplace_deployment_id: &str,
    bid: &Bid,
    api_key: &str,
  ) -> Result<Lease, OrchestratorError> {
    let url = self.base_url.join("/v1/leases").expect("fixed path");
    let provider_address = bid.provider_address.clone();

    with_retries(deadlines::RETRY_MAX_ATTEMPTS, "createLease", || async {
      let response = self
        .client
        .post(url.clone())
        .bearer_auth(api_key)
        .timeout(deadlines::CREATE_LEASE)
        .json(&json!({
          "manifest": manifest,
          "dseq": marketplace_deployment_id,
          "provider": bid.provider_address,
          "bidSeq": bid.bid_seq,
        }))
        .send()
        .await
        .map_err(|e| OrchestratorError::Transport {
          operation: "createLease".to_string(),
          cause: e.to_string(),
        })?;

      let status = response.status();
      if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let err = classify_status(status, body.clone());
        return Err(if matches!(status.as_u16(), 429 | 503 | 504) {
          err
        } else if body.to_lowercase().contains("connection refused") {
          OrchestratorError::ProviderUnavailable {
            provider: provider_address.clone(),
            cause: body,
          }
        } else {
          err
        });
      }

      let parsed: LeaseResponse = response
        .json()
        .await
        .map_err(|e| OrchestratorError::ExternalMalformed(e.to_string()))?;

      let lease_id = parsed
        .lease_id
        .ok_or_else(|| OrchestratorError::ExternalMalformed("response missing leaseId".to_string()))?;

      Ok(Lease {
        provider_address: provider_address.clone(),
        marketplace_lease_id: lease_id,
        services: parsed.services.clone(),
      })
    })
    .await
  }

  async fn get_provider_details(
    &self,
    provider_address: &str,
    api_key: &str,
  ) -> Result<Option<ProviderDetails>, OrchestratorError> {
    let url = self
      .base_url
      .join(&format!("/v1/providers/{}", provider_address))
      .expect("fixed path");

    let response = self
      .client
      .get(url)
      .bearer_auth(api_key)
      .timeout(deadlines::CREATE_LEASE)
      .send()
      .await
      .map_err(|e| OrchestratorError::Transport {
        operation: "getProviderDetails".to_string(),
        cause: e.to_string(),
      })?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
      return Ok(None);
    }
    if !response.status().is_success() {
      let status = response.status();
      let body = response.text().await.unwrap_or_default();
      return Err(classify_status(status, body));
    }

    let parsed: ProviderResponse = response
      .json()
      .await
      .map_err(|e| OrchestratorError::ExternalMalformed(e.to_string()))?;

    Ok(match (parsed.uri, parsed.status) {
      (Some(uri), Some(status)) => Some(ProviderDetails { uri, status }),
      _ => None,
    })
  }

  async fn check_provider_health(&self, uri: &str) -> bool {
    let url = format!("{}/status", uri.trim_end_matches('/'));
    match self.client.get(&url).timeout(deadlines::HEALTH_PROBE).send().await {
      Ok(response) => response.status().is_success(),
      Err(e) => {
        warn!("health probe for {} failed: {}", uri, e);
        false
      }
    }
  }

  async fn list_certificates(&self, api_key: &str) -> Result<Option<Vec<Certificate>>, OrchestratorError> {
    let url = self.base_url.join("/v1/certificates").expect("fixed path");
    let response = self
      .client
      .get(url)
      .bearer_auth(api_key)
      .timeout(deadlines::CREATE_LEASE)
      .send()
      .await
      .map_err(|e| OrchestratorError::Transport {
        operation: "listCertificates".to_string(),
        cause: e.to_string(),
      })?;

    if !response.status().is_success() {
      return Ok(None);
    }

    match response.json::<CertificatesResponse>().await {
      Ok(parsed) => Ok(Some(
        parsed
          .certificates
          .into_iter()
          .map(|c| Certificate { id: c.id, state: c.state })
          .collect(),
      )),
      Err(_) => Ok(None),
    }
  }

  async fn ensure_certificate(&self, api_key: &str) -> bool {
    let has_valid = |certs: &[Certificate]| certs.iter().any(|c| c.state == "valid");

    if let Ok(Some(certs)) = self.list_certificates(api_key).await {
      if has_valid(&certs) {
        return true;
      }
    }

    let url = self.base_url.join("/v1/certificates").expect("fixed path");
    let response = self
      .client
      .post(url)
      .bearer_auth(api_key)
      .timeout(deadlines::CREATE_LEASE)
      .json(&json!({}))
      .send()
      .await;

    match response {
      Ok(r) if r.status().is_success() => match r.json::<serde_json::Value>().await {
        Ok(_) => true,
        // Non-JSON 2xx (e.g. an HTML error page behind the status code) is an
        // observed upstream quirk: fall back to a re-list.
        Err(_) => self.relist_and_check_valid(api_key).await,
      },
      Ok(r) => {
        let body = r.text().await.unwrap_or_default();
        if body.to_lowercase().contains("already exists") {
          self.relist_and_check_valid(api_key).await
        } else {
          warn!("ensureCertificate: create failed, proceeding without one: {}", body);
          true
        }
      }
      Err(e) => {
        warn!("ensureCertificate: transport error, proceeding without one: {}", e);
        true
      }
    }
  }

  async fn close_deployment(&self, marketplace_deployment_id: &str, api_key: &str) -> Result<(), OrchestratorError> {
    let url = self
      .base_url
      .join(&format!("/v1/deployments/{}", marketplace_deployment_id))
      .expect("fixed path");

    let response = self
      .client
      .delete(url)
      .bearer_auth(api_key)
      .timeout(deadlines::CREATE_LEASE)
      .send()
      .await
      .map_err(|e| OrchestratorError::Transport {
        operation: "closeDeployment".to_string(),
        cause: e.to_string(),
      })?;

    let status = response.status();
    // A dseq already closed upstream (404/410) counts as success.
    if status.is_success() || status.as_u16() == 404 || status.as_u16() == 410 {
      info!("closed marketplace deployment {}", marketplace_deployment_id);
      Ok(())
    } else {
      let body = response.text().await.unwrap_or_default();
      Err(classify_status(status, body))
    }
  }

  async fn list_open_deployments(&self, api_key: &str) -> Result<Vec<OpenDeployment>, OrchestratorError> {
    let url = self.base_url.join("/v1/deployments").expect("fixed path");
    let response = self
      .client
      .get(url)
      .bearer_auth(api_key)
      .timeout(deadlines::CREATE_LEASE)
      .send()
      .await
      .map_err(|e| OrchestratorError::Transport {
        operation: "listOpenDeployments".to_string(),
        cause: e.to_string(),
      })?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(classify_status(status, body));
    }

    let parsed: OpenDeploymentsResponse = response
      .json()
      .await
      .map_err(|e| OrchestratorError::ExternalMalformed(e.to_string()))?;

    Ok(
      parsed
        .deployments
        .into_iter()
        .map(|d| OpenDeployment {
          dseq: d.dseq,
          created_at: d.created_at,
        })
        .collect(),
    )
  }
}

impl Implementation {
  async fn relist_and_check_valid(&self, api_key: &str) -> bool {
    match self.list_certificates(api_key).await {
      Ok(Some(certs)) => certs.iter().any(|c| c.state == "valid"),
      _ => {
        warn!("ensureCertificate: re-list after ambiguous create failed, proceeding without one");
        true
      }
    }
  }
}
