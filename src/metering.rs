//! The usage metering bridge: ingest billable events to the payment
//! provider, tolerant of a missing meter, never fatal to its caller.

use crate::cache;
use crate::checkout::PaymentProvider;
use log::warn;
use std::time::Duration;

const METER_NAME: &str = "ai_usage";
/// Meter-existence is cheap to cache; a customer's meter does not appear
/// mid-session, so a conservative TTL avoids re-checking on every event.
const METER_CACHE_TTL: Duration = Duration::from_secs(3600);

pub struct RecordResult {
  pub success: bool,
  pub recorded: bool,
  pub error: Option<String>,
}

/// Best-effort: swallows and logs every failure so metering can never fail
/// the caller's operation.
pub async fn record_usage(payment: &dyn PaymentProvider, cache: &dyn cache::Service, billing_customer_id: &str, event_name: &str, amount: f64) {
  if let Err(e) = payment.ingest_usage_event(billing_customer_id, event_name, amount).await {
    warn!("usage event ingest failed for {}: {}", billing_customer_id, e);
  }
  cache.delete(&cache::meter_key(billing_customer_id)).await;
}

/// First validates the `ai_usage` meter exists (cached), then optionally
/// ingests anyway when `fallback_to_local` is set.
pub async fn record_usage_safe(
  payment: &dyn PaymentProvider,
  cache: &dyn cache::Service,
  billing_customer_id: &str,
  event_name: &str,
  amount: f64,
  fallback_to_local: bool,
) -> RecordResult {
  let meter_key = cache::meter_key(billing_customer_id);
  let has_meter = match cache.get(&meter_key).await {
    Some(cached) => cached == "true",
    None => {
      let exists = payment.meter_exists(billing_customer_id, METER_NAME).await.unwrap_or(false);
      cache.set(&meter_key, if exists { "true" } else { "false" }, METER_CACHE_TTL).await;
      exists
    }
  };

  if !has_meter && !fallback_to_local {
    return RecordResult {
      success: false,
      recorded: false,
      error: None,
    };
  }

  if !has_meter {
    return match payment.ingest_usage_event(billing_customer_id, event_name, amount).await {
      Ok(()) => RecordResult {
        success: true,
        recorded: false,
        error: None,
      },
      Err(e) => RecordResult {
        success: true,
        recorded: false,
        error: Some(e.to_string()),
      },
    };
  }

  record_usage(payment, cache, billing_customer_id, event_name, amount).await;
  RecordResult {
    success: true,
    recorded: true,
    error: None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::NoopCache;
  use crate::checkout::InMemoryPaymentProvider;

  #[tokio::test]
  async fn record_usage_never_propagates_a_failure() {
    let payment = InMemoryPaymentProvider::new();
    let cache = NoopCache;
    record_usage(&payment, &cache, "cus_1", "deployment.active", 1.0).await;
  }

  #[tokio::test]
  async fn record_usage_safe_without_meter_and_no_fallback_reports_unrecorded() {
    let payment = InMemoryPaymentProvider::new();
    let cache = NoopCache;
    let result = record_usage_safe(&payment, &cache, "cus_missing", "deployment.active", 1.0, false).await;
    assert!(!result.success);
    assert!(!result.recorded);
  }

  #[tokio::test]
  async fn record_usage_safe_without_meter_but_with_fallback_still_ingests() {
    let payment = InMemoryPaymentProvider::new();
    let cache = NoopCache;
    let result = record_usage_safe(&payment, &cache, "cus_missing", "deployment.active", 1.0, true).await;
    assert!(result.success);
    assert!(!result.recorded);
  }

  #[tokio::test]
  async fn record_usage_safe_with_meter_present_records() {
    let payment = InMemoryPaymentProvider::new();
    payment.seed_meter("cus_1", "ai_usage");
    let cache = NoopCache;
    let result = record_usage_safe(&payment, &cache, "cus_1", "deployment.active", 1.0, false).await;
    assert!(result.success);
    assert!(result.recorded);
  }
}
