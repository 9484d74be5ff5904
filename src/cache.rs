//! Optional key/value cache with pattern invalidation. Every call site
//! must tolerate a miss or an error; both implementations below uphold that —
//! the no-op variant by construction, the backed variant by swallowing and
//! logging transport failures instead of propagating a cache error upward.

use async_trait::async_trait;
use log::warn;
use std::time::Duration;

#[async_trait]
pub trait Service: Send + Sync + 'static {
  async fn get(&self, key: &str) -> Option<String>;
  async fn set(&self, key: &str, value: &str, ttl: Duration);
  async fn delete(&self, key: &str);
  async fn invalidate_pattern(&self, pattern: &str);
}

/// Selected at construction time when `CACHE_URL`/`CACHE_TOKEN` are absent —
/// call sites never branch on which variant they hold.
pub struct NoopCache;

#[async_trait]
impl Service for NoopCache {
  async fn get(&self, _key: &str) -> Option<String> {
    None
  }

  async fn set(&self, _key: &str, _value: &str, _ttl: Duration) {}

  async fn delete(&self, _key: &str) {}

  async fn invalidate_pattern(&self, _pattern: &str) {}
}

/// Upstash-style Redis REST client: every command is posted as a JSON array
/// `["CMD", arg, ...]` with bearer auth, one HTTP round trip per call.
pub struct HttpCache {
  base_url: url::Url,
  token: String,
  client: reqwest::Client,
}

impl HttpCache {
  pub fn new(base_url: url::Url, token: String) -> Self {
    HttpCache {
      base_url,
      token,
      client: reqwest::Client::new(),
    }
  }

  async fn command(&self, parts: Vec<String>) -> Result<serde_json::Value, reqwest::Error> {
    let response = self
      .client
      .post(self.base_url.clone())
      .bearer_auth(&self.token)
      .json(&parts)
      .send()
      .await?;
    response.json::<serde_json::Value>().await
  }
}

#[async_trait]
impl Service for HttpCache {
  async fn get(&self, key: &str) -> Option<String> {
    match self.command(vec!["GET".to_string(), key.to_string()]).await {
      Ok(value) => value.get("result").and_then(|v| v.as_str()).map(str::to_string),
      Err(e) => {
        warn!("cache get failed, treating as miss: {}", e);
        None
      }
    }
  }

  async fn set(&self, key: &str, value: &str, ttl: Duration) {
    let parts = vec![
      "SET".to_string(),
      key.to_string(),
      value.to_string(),
      "EX".to_string(),
      ttl.as_secs().to_string(),
    ];
    if let Err(e) = self.command(parts).await {
      warn!("cache set failed, ignoring: {}", e);
    }
  }

  async fn delete(&self, key: &str) {
    if let Err(e) = self.command(vec!["DEL".to_string(), key.to_string()]).await {
      warn!("cache delete failed, ignoring: {}", e);
    }
  }

  async fn invalidate_pattern(&self, pattern: &str) {
    let keys = match self.command(vec!["KEYS".to_string(), pattern.to_string()]).await {
      Ok(value) => value
        .get("result")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|k| k.as_str().map(str::to_string)).collect())
        .unwrap_or_else(Vec::new),
      Err(e) => {
        warn!("cache pattern scan failed, ignoring: {}", e);
        Vec::new()
      }
    };
    for key in keys {
      self.delete(&key).await;
    }
  }
}

/// Key under which a user's deployment list is cached: every
/// status-changing transition invalidates exactly this key.
pub fn deployments_key(user_id: &uuid::Uuid) -> String {
  format!("deployments:{}", user_id)
}

/// Key under which a customer's metering fact (whether the `ai_usage` meter
/// exists) is cached.
pub fn meter_key(billing_customer_id: &str) -> String {
  format!("meter:{}", billing_customer_id)
}
