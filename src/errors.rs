//! Classification of every failure mode the orchestrator can surface.
//!
//! Call sites match on the predicates (`is_retryable`, `is_provider_unavailable`)
//! rather than on the variant directly, so a new retryable variant never forces
//! every match arm in the crate to be revisited.

/// A marketplace provider's chain address, kept as an opaque string since the
/// orchestrator never interprets it beyond equality and display.
pub type ProviderAddress = String;

#[derive(Debug, Clone, thiserror::Error)]
pub enum OrchestratorError {
  #[error("invalid argument: {0}")]
  InvalidArgument(String),

  #[error("unauthorized")]
  Unauthorized,

  #[error("timed out waiting for {operation}")]
  Timeout { operation: String },

  #[error("upstream responded with status {status}")]
  ExternalProtocol { status: u16, body: String },

  #[error("upstream response was missing required fields: {0}")]
  ExternalMalformed(String),

  #[error("provider {provider} is unavailable: {cause}")]
  ProviderUnavailable {
    provider: ProviderAddress,
    cause: String,
  },

  #[error("all providers failed, last error: {last_error}")]
  AllProvidersFailed {
    failed_providers: Vec<ProviderAddress>,
    last_error: Box<OrchestratorError>,
  },

  #[error("certificate issue: {0}")]
  CertificateIssue(String),

  #[error("cache error: {0}")]
  CacheError(String),

  #[error("metering error: {0}")]
  MeteringError(String),

  #[error("transport error calling {operation}: {cause}")]
  Transport { operation: String, cause: String },
}

impl OrchestratorError {
  pub fn invalid_argument(msg: impl Into<String>) -> Self {
    OrchestratorError::InvalidArgument(msg.into())
  }

  /// Status codes 429/503/504 and malformed 2xx bodies are retried with
  /// exponential backoff; everything else is fatal on the first try.
  pub fn is_retryable(&self) -> bool {
    match self {
      OrchestratorError::ExternalProtocol { status, .. } => {
        matches!(status, 429 | 503 | 504)
      }
      OrchestratorError::ExternalMalformed(_) => true,
      OrchestratorError::Timeout { .. } => true,
      OrchestratorError::Transport { .. } => true,
      OrchestratorError::ProviderUnavailable { .. } => false,
      _ => false,
    }
  }

  pub fn is_provider_unavailable(&self) -> bool {
    matches!(self, OrchestratorError::ProviderUnavailable { .. })
  }

  /// Maps to generic, technical-detail-free strings safe to return to a
  /// client. Never includes status codes, provider addresses, or the
  /// marketplace base URL.
  pub fn user_message(&self) -> &'static str {
    match self {
      OrchestratorError::InvalidArgument(_) => "the request was invalid",
      OrchestratorError::Unauthorized => "unauthorized",
      OrchestratorError::Timeout { .. } => "the deployment request timed out — please try again later",
      OrchestratorError::AllProvidersFailed { .. } => {
        "no provider accepted the deployment — please try again later"
      }
      _ => "an error occurred",
    }
  }
}

/// HTTP status an ingress handler should answer with for a given error.
pub fn http_status_for(err: &OrchestratorError) -> u16 {
  match err {
    OrchestratorError::InvalidArgument(_) => 400,
    OrchestratorError::Unauthorized => 401,
    OrchestratorError::Timeout { .. } => 504,
    _ => 500,
  }
}
