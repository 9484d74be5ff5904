//! Entities: the shapes every component agrees on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentStatus {
  Pending,
  Deploying,
  Active,
  Failed,
}

impl DeploymentStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      DeploymentStatus::Pending => "pending",
      DeploymentStatus::Deploying => "deploying",
      DeploymentStatus::Active => "active",
      DeploymentStatus::Failed => "failed",
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, DeploymentStatus::Active | DeploymentStatus::Failed)
  }
}

#[derive(Clone, Debug)]
pub struct User {
  pub id: Uuid,
  pub external_auth_id: Option<String>,
  pub email: String,
  pub billing_customer_id: Option<String>,
  pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct Deployment {
  pub id: Uuid,
  pub user_id: Uuid,
  pub model: String,
  pub channel: String,
  /// Ciphertext (`ivHex:ciphertextHex:authTagHex`); never the raw token.
  pub channel_token_encrypted: String,
  /// Deterministic HMAC-SHA256 digest of the plaintext channel token, used
  /// to find a duplicate pending checkout without decrypting anything.
  pub channel_token_fingerprint: String,
  pub llm_api_key_encrypted: String,
  pub status: DeploymentStatus,
  pub checkout_session_id: Option<String>,
  pub marketplace_deployment_id: Option<String>,
  pub marketplace_lease_id: Option<String>,
  pub provider_url: Option<String>,
  pub error_message: Option<String>,
  pub internal_api_key: Uuid,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

/// Fields a status transition is allowed to touch.
/// Every field is `Option`: `None` means "leave as-is", not "clear it".
#[derive(Clone, Debug, Default)]
pub struct DeploymentStatusDetails {
  pub marketplace_deployment_id: Option<String>,
  pub marketplace_lease_id: Option<String>,
  pub provider_url: Option<String>,
  pub error_message: Option<String>,
}

#[derive(Clone, Debug)]
pub struct NewDeployment {
  pub user_id: Uuid,
  pub model: String,
  pub channel: String,
  pub channel_token_encrypted: String,
  pub channel_token_fingerprint: String,
  pub llm_api_key_encrypted: String,
}

/// A single blacklisted provider address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlacklistedProvider {
  pub provider_address: String,
}

/// A provider's offer; never persisted.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bid {
  pub owner_address: String,
  pub marketplace_deployment_id: String,
  pub group_seq: u64,
  pub order_seq: u64,
  pub provider_address: String,
  pub bid_seq: u64,
  pub price_amount: String,
  pub price_denom: String,
  pub state: String,
  pub created_at: DateTime<Utc>,
  pub certificate_required: bool,
}

/// The accepted bid; never persisted.
#[derive(Clone, Debug, Deserialize)]
pub struct Lease {
  pub provider_address: String,
  pub marketplace_lease_id: String,
  /// service name -> exposed URIs.
  pub services: BTreeMap<String, Vec<String>>,
}

impl Lease {
  /// The first URI of the first service with a non-empty URI list.
  pub fn service_url(&self) -> Option<&str> {
    self
      .services
      .values()
      .find(|uris| !uris.is_empty())
      .and_then(|uris| uris.first())
      .map(String::as_str)
  }
}
