//! Deterministic in-memory fakes for the external collaborators that don't
//! already have one alongside their trait (`InMemoryDeploymentRepository` &c.
//! live in `repository.rs`, `InMemoryUserRepository` in `users.rs`,
//! `InMemoryPaymentProvider` in `checkout.rs`, `NoopCache` in `cache.rs`).
//! This module holds the one fake complex enough to need its own scripting
//! surface: the marketplace client, driven by a response queue so scenario
//! tests can reproduce 429/429/200 and 503×3 boundary behaviors without any
//! real network or sleep.

use crate::domain::{Bid, Lease};
use crate::errors::OrchestratorError;
use crate::marketplace::{Certificate, CreatedDeployment, OpenDeployment, ProviderDetails, Service};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Scripted marketplace client. Every method falls back to a reasonable
/// default (success) when nothing was scripted for the call, so a test only
/// needs to script the behaviors it cares about.
#[derive(Default)]
pub struct FakeMarketplace {
  next_dseq: Mutex<u64>,
  bids: Mutex<Vec<Bid>>,
  lease_outcomes: Mutex<HashMap<String, VecDeque<Result<Lease, OrchestratorError>>>>,
  provider_health: Mutex<HashMap<String, bool>>,
  open_deployments: Mutex<Vec<OpenDeployment>>,
  closed_dseqs: Mutex<Vec<String>>,
  create_deployment_error: Mutex<Option<String>>,
  poll_for_bids_error: Mutex<bool>,
}

impl FakeMarketplace {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_bids(&self, bids: Vec<Bid>) {
    *self.bids.lock().unwrap() = bids;
  }

  /// Queues the outcomes `create_lease` returns for `provider_address`, in
  /// order; once exhausted, further calls repeat the last scripted outcome.
  pub fn script_lease(&self, provider_address: &str, outcomes: Vec<Result<Lease, OrchestratorError>>) {
    self
      .lease_outcomes
      .lock()
      .unwrap()
      .insert(provider_address.to_string(), outcomes.into());
  }

  pub fn set_health(&self, provider_address: &str, healthy: bool) {
    self.provider_health.lock().unwrap().insert(provider_address.to_string(), healthy);
  }

  pub fn seed_open_deployment(&self, dseq: &str, created_at: DateTime<Utc>) {
    self.open_deployments.lock().unwrap().push(OpenDeployment {
      dseq: dseq.to_string(),
      created_at,
    });
  }

  pub fn fail_create_deployment(&self, message: &str) {
    *self.create_deployment_error.lock().unwrap() = Some(message.to_string());
  }

  pub fn fail_poll_for_bids(&self) {
    *self.poll_for_bids_error.lock().unwrap() = true;
  }

  pub fn closed_dseqs(&self) -> Vec<String> {
    self.closed_dseqs.lock().unwrap().clone()
  }
}

#[async_trait]
impl Service for FakeMarketplace {
  async fn create_deployment(&self, descriptor: &str, _api_key: &str, deposit_usd: f64) -> Result<CreatedDeployment, OrchestratorError> {
    if deposit_usd < 5.0 {
      return Err(OrchestratorError::invalid_argument("deposit must be at least 5 USD"));
    }
    if let Some(message) = self.create_deployment_error.lock().unwrap().clone() {
      return Err(OrchestratorError::ExternalProtocol { status: 500, body: message });
    }
    let mut counter = self.next_dseq.lock().unwrap();
    *counter += 1;
    Ok(CreatedDeployment {
      marketplace_deployment_id: format!("dseq-{}", *counter),
      manifest: descriptor.to_string(),
    })
  }

  async fn poll_for_bids(&self, _marketplace_deployment_id: &str, _api_key: &str) -> Result<Vec<Bid>, OrchestratorError> {
    if *self.poll_for_bids_error.lock().unwrap() {
      return Err(OrchestratorError::Timeout {
        operation: "pollForBids".to_string(),
      });
    }
    let bids = self.bids.lock().unwrap().clone();
    if bids.is_empty() {
      Err(OrchestratorError::Timeout {
        operation: "pollForBids".to_string(),
      })
    } else {
      Ok(bids)
    }
  }

  async fn create_lease(&self, _manifest: &str, marketplace_deployment_id: &str, bid: &Bid, _api_key: &str) -> Result<Lease, OrchestratorError> {
    let mut guard = self.lease_outcomes.lock().unwrap();
    if let Some(queue) = guard.get_mut(&bid.provider_address) {
      if queue.len() > 1 {
        return queue.pop_front().unwrap();
      }
      if let Some(last) = queue.front() {
        return last.clone();
      }
    }
    Ok(Lease {
      provider_address: bid.provider_address.clone(),
      marketplace_lease_id: format!("lease-{}-{}", marketplace_deployment_id, bid.provider_address),
      services: [("openclaw".to_string(), vec![format!("https://{}.example/bot", bid.provider_address)])]
        .into_iter()
        .collect(),
    })
  }

  async fn get_provider_details(&self, provider_address: &str, _api_key: &str) -> Result<Option<ProviderDetails>, OrchestratorError> {
    Ok(Some(ProviderDetails {
      uri: format!("https://{}.example", provider_address),
      status: "active".to_string(),
    }))
  }

  async fn check_provider_health(&self, uri: &str) -> bool {
    let provider_address = uri.trim_start_matches("https://").trim_end_matches(".example");
    *self.provider_health.lock().unwrap().get(provider_address).unwrap_or(&true)
  }

  async fn list_certificates(&self, _api_key: &str) -> Result<Option<Vec<Certificate>>, OrchestratorError> {
    Ok(Some(Vec::new()))
  }

  async fn ensure_certificate(&self, _api_key: &str) -> bool {
    true
  }

  async fn close_deployment(&self, marketplace_deployment_id: &str, _api_key: &str) -> Result<(), OrchestratorError> {
    self.closed_dseqs.lock().unwrap().push(marketplace_deployment_id.to_string());
    Ok(())
  }

  async fn list_open_deployments(&self, _api_key: &str) -> Result<Vec<OpenDeployment>, OrchestratorError> {
    Ok(self.open_deployments.lock().unwrap().clone())
  }
}

pub fn bid(provider: &str, price: &str) -> Bid {
  Bid {
    owner_address: "owner".to_string(),
    marketplace_deployment_id: "1".to_string(),
    group_seq: 1,
    order_seq: 1,
    provider_address: provider.to_string(),
    bid_seq: 1,
    price_amount: price.to_string(),
    price_denom: "uakt".to_string(),
    state: "open".to_string(),
    created_at: Utc::now(),
    certificate_required: false,
  }
}
