//! Typed configuration loaded once at startup. Every required variable is
//! validated eagerly so a misconfigured process fails at boot, not mid-flight.

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use url::Url;

#[derive(Debug, Clone)]
pub struct MarketplaceConfig {
  pub base_url: Url,
  pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct PaymentConfig {
  pub access_token: String,
  pub webhook_secret: String,
  pub product_id: String,
  pub sandbox: bool,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
  pub url: Url,
  pub token: String,
}

#[derive(Debug, Clone)]
pub struct Config {
  pub marketplace: MarketplaceConfig,
  pub upstream_llm_key: String,
  pub encryption_key: [u8; 32],
  pub payment: PaymentConfig,
  pub cache: Option<CacheConfig>,
  pub database_url: Option<String>,
  pub http_listen_addr: SocketAddr,
  pub log_level: String,
  pub ibc_denom: String,
  pub checkout_success_url: String,
  pub deposit_usd: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("missing required environment variable {0}")]
  Missing(&'static str),
  #[error("invalid value for environment variable {name}: {cause}")]
  Invalid { name: &'static str, cause: String },
}

fn required(name: &'static str) -> Result<String, ConfigError> {
  env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn optional(name: &'static str) -> Option<String> {
  env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_hex_key(name: &'static str, raw: &str) -> Result<[u8; 32], ConfigError> {
  let bytes = hex::decode(raw).map_err(|e| ConfigError::Invalid {
    name,
    cause: e.to_string(),
  })?;
  bytes.try_into().map_err(|v: Vec<u8>| ConfigError::Invalid {
    name,
    cause: format!("expected 32 bytes, found {}", v.len()),
  })
}

impl Config {
  /// Assembles configuration from the process environment. Fails fast:
  /// a missing or malformed required variable aborts startup rather than
  /// surfacing later as a confusing runtime error.
  pub fn from_env() -> Result<Self, ConfigError> {
    let marketplace_base_url =
      env::var("MARKETPLACE_API_BASE_URL").unwrap_or_else(|_| "https://console-api.akash.network".to_string());
    let marketplace = MarketplaceConfig {
      base_url: Url::parse(&marketplace_base_url).map_err(|e| ConfigError::Invalid {
        name: "MARKETPLACE_API_BASE_URL",
        cause: e.to_string(),
      })?,
      api_key: required("MARKETPLACE_API_KEY")?,
    };

    let encryption_key = parse_hex_key("ENCRYPTION_KEY", &required("ENCRYPTION_KEY")?)?;

    let payment = PaymentConfig {
      access_token: required("PAYMENT_ACCESS_TOKEN")?,
      webhook_secret: required("PAYMENT_WEBHOOK_SECRET")?,
      product_id: required("PAYMENT_PRODUCT_ID")?,
      sandbox: required("PAYMENT_SERVER")? != "production",
    };

    let cache = match (optional("CACHE_URL"), optional("CACHE_TOKEN")) {
      (Some(url), Some(token)) => Some(CacheConfig {
        url: Url::parse(&url).map_err(|e| ConfigError::Invalid {
          name: "CACHE_URL",
          cause: e.to_string(),
        })?,
        token,
      }),
      _ => None,
    };

    let http_listen_addr = optional("HTTP_LISTEN_ADDR")
      .unwrap_or_else(|| "127.0.0.1:8080".to_string())
      .parse()
      .map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
        name: "HTTP_LISTEN_ADDR",
        cause: e.to_string(),
      })?;

    Ok(Config {
      marketplace,
      upstream_llm_key: required("UPSTREAM_LLM_KEY")?,
      encryption_key,
      payment,
      cache,
      database_url: optional("DATABASE_URL"),
      http_listen_addr,
      log_level: optional("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
      ibc_denom: optional("IBC_DENOM").unwrap_or_else(|| "ibc/placeholder".to_string()),
      checkout_success_url: optional("CHECKOUT_SUCCESS_URL").unwrap_or_else(|| "https://app.openclaw.dev/success".to_string()),
      deposit_usd: optional("DEPOSIT_USD")
        .map(|v| v.parse().unwrap_or(deadlines::MIN_DEPOSIT_USD))
        .unwrap_or(deadlines::MIN_DEPOSIT_USD),
    })
  }
}

/// Ceilings the marketplace client and retry engine are bound by.
pub mod deadlines {
  use super::Duration;

  pub const CREATE_DEPLOYMENT: Duration = Duration::from_secs(30);
  pub const BID_POLL_TOTAL: Duration = Duration::from_secs(60);
  pub const BID_POLL_INTERVAL: Duration = Duration::from_secs(3);
  pub const BID_POLL_MAX_ATTEMPTS: u32 = 20;
  pub const CREATE_LEASE: Duration = Duration::from_secs(30);
  pub const HEALTH_PROBE: Duration = Duration::from_secs(10);

  pub const RETRY_BASE: Duration = Duration::from_secs(2);
  pub const RETRY_FACTOR: f64 = 2.0;
  pub const RETRY_MAX_ATTEMPTS: u32 = 3;

  pub const MIN_DEPOSIT_USD: f64 = 5.0;
  pub const MAX_JOB_ATTEMPTS: u32 = 3;
  /// Grace window before an orphaned marketplace deployment is treated as a
  /// zombie. A configuration choice, not a derived value.
  pub const ZOMBIE_GRACE: Duration = Duration::from_secs(15 * 60);
}
