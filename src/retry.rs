//! The retry and failover engine: bid filtering, stable cheapest-first sort,
//! and the sequential try-next-provider loop with skip-on-unavailable.

use crate::domain::{Bid, Lease};
use crate::errors::{OrchestratorError, ProviderAddress};
use crate::marketplace;
use bigdecimal::BigDecimal;
use log::{info, warn};
use std::str::FromStr;

/// Non-persisted view of the operator-curated blacklist.
pub trait Blacklist: Send + Sync + 'static {
  fn is_blacklisted(&self, provider_address: &str) -> bool;
}

fn price_of(bid: &Bid) -> BigDecimal {
  // A malformed price sorts last rather than panicking; the marketplace is
  // the authority on well-formed bids and a parse failure here is its bug,
  // not ours to crash over.
  BigDecimal::from_str(&bid.price_amount).unwrap_or_else(|_| BigDecimal::from_str("999999999999").unwrap())
}

/// Filters blacklisted providers, then stable-sorts by price ascending.
/// Ties keep the marketplace's own input order.
pub fn filter_and_sort_bids(bids: &[Bid], blacklist: &dyn Blacklist) -> Vec<Bid> {
  let mut candidates: Vec<Bid> = bids
    .iter()
    .filter(|b| !blacklist.is_blacklisted(&b.provider_address))
    .cloned()
    .collect();
  candidates.sort_by(|a, b| price_of(a).cmp(&price_of(b)));
  candidates
}

/// A single-attempt helper kept distinct from the production
/// `try_all_bids_until_success` path, used where only one attempt is wanted
/// (tests, and callers that want to pre-inspect a choice).
pub fn select_cheapest_bid(bids: &[Bid], blacklist: &dyn Blacklist) -> Result<Bid, OrchestratorError> {
  filter_and_sort_bids(bids, blacklist)
    .into_iter()
    .next()
    .ok_or_else(|| OrchestratorError::invalid_argument("no bids to select from"))
}

pub struct LeaseOutcome {
  pub lease: Lease,
  pub provider_address: ProviderAddress,
}

/// The production path: walks cheapest-first, health-probes
/// advisory-only, skips providers whose lease attempt is `ProviderUnavailable`,
/// re-raises any other error immediately, and fails with `AllProvidersFailed`
/// once every non-blacklisted bid has been tried.
pub async fn try_all_bids_until_success(
  marketplace: &dyn marketplace::Service,
  blacklist: &dyn Blacklist,
  manifest: &str,
  marketplace_deployment_id: &str,
  bids: &[Bid],
  api_key: &str,
) -> Result<LeaseOutcome, OrchestratorError> {
  let candidates = filter_and_sort_bids(bids, blacklist);
  if candidates.is_empty() {
    return Err(OrchestratorError::AllProvidersFailed {
      failed_providers: Vec::new(),
      last_error: Box::new(OrchestratorError::invalid_argument("all bids were blacklisted")),
    });
  }

  let mut failed_providers: Vec<ProviderAddress> = Vec::new();
  let mut last_error: Option<OrchestratorError> = None;

  for bid in &candidates {
    if let Ok(Some(provider)) = marketplace.get_provider_details(&bid.provider_address, api_key).await {
      if !marketplace.check_provider_health(&provider.uri).await {
        // Probes can be wrong; the marketplace's own lease-create call is
        // the authority, so a failed probe is logged, never a skip.
        warn!("health probe failed for provider {}, attempting lease anyway", bid.provider_address);
      }
    }

    match marketplace
      .create_lease(manifest, marketplace_deployment_id, bid, api_key)
      .await
    {
      Ok(lease) => {
        return Ok(LeaseOutcome {
          lease,
          provider_address: bid.provider_address.clone(),
        })
      }
      Err(e) if e.is_provider_unavailable() => {
        info!("provider {} unavailable, trying next bid: {}", bid.provider_address, e);
        failed_providers.push(bid.provider_address.clone());
        last_error = Some(e);
      }
      Err(e) if e.is_retryable() => {
        // The per-call retries inside create_lease already ran their course;
        // record and move to the next bid rather than fail the whole attempt.
        info!(
          "lease attempt against {} exhausted its retries, trying next bid: {}",
          bid.provider_address, e
        );
        failed_providers.push(bid.provider_address.clone());
        last_error = Some(e);
      }
      Err(e) => {
        // Fatal: not a provider-specific or retryable failure, so the whole
        // deployment attempt fails immediately.
        return Err(e);
      }
    }
  }

  Err(OrchestratorError::AllProvidersFailed {
    failed_providers,
    last_error: Box::new(
      last_error.unwrap_or_else(|| OrchestratorError::invalid_argument("no bids were attempted")),
    ),
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  struct NoBlacklist;
  impl Blacklist for NoBlacklist {
    fn is_blacklisted(&self, _: &str) -> bool {
      false
    }
  }

  struct FixedBlacklist(Vec<String>);
  impl Blacklist for FixedBlacklist {
    fn is_blacklisted(&self, provider_address: &str) -> bool {
      self.0.iter().any(|p| p == provider_address)
    }
  }

  fn bid(provider: &str, price: &str) -> Bid {
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
      created_at: chrono::Utc::now(),
      certificate_required: false,
    }
  }

  #[test]
  fn sorts_cheapest_first_stably_on_ties() {
    let bids = vec![bid("p1", "1000"), bid("p2", "500"), bid("p3", "500")];
    let sorted = filter_and_sort_bids(&bids, &NoBlacklist);
    assert_eq!(sorted[0].provider_address, "p2");
    assert_eq!(sorted[1].provider_address, "p3");
    assert_eq!(sorted[2].provider_address, "p1");
  }

  #[test]
  fn select_cheapest_bid_matches_head_of_stable_sort() {
    let bids = vec![bid("p1", "1000"), bid("p2", "500")];
    let chosen = select_cheapest_bid(&bids, &NoBlacklist).unwrap();
    assert_eq!(chosen.provider_address, "p2");
  }

  #[test]
  fn select_cheapest_bid_fails_on_empty_input() {
    assert!(select_cheapest_bid(&[], &NoBlacklist).is_err());
  }

  #[test]
  fn filters_out_blacklisted_providers() {
    let bids = vec![bid("p1", "1000"), bid("p2", "500")];
    let blacklist = FixedBlacklist(vec!["p2".to_string()]);
    let sorted = filter_and_sort_bids(&bids, &blacklist);
    assert_eq!(sorted.len(), 1);
    assert_eq!(sorted[0].provider_address, "p1");
  }
}
