//! The application context: the single struct built once in `main` holding
//! one trait-object handle per collaborator. Every HTTP handler and
//! background task receives it by reference or cloned `Arc`; nothing here is
//! reached through a global or static.

use crate::config::Config;
use crate::{cache, checkout, crypto, events, job, marketplace, ratelimit, repository, users};
use std::sync::Arc;

pub struct Context {
  pub repo: Arc<dyn repository::DeploymentRepository>,
  pub users: Arc<dyn users::UserRepository>,
  pub payment: Arc<dyn checkout::PaymentProvider>,
  pub crypto: Arc<dyn crypto::Service>,
  pub cache: Arc<dyn cache::Service>,
  pub events: Arc<dyn events::Service>,
  pub ratelimit: Arc<dyn ratelimit::Service>,
  pub marketplace: Arc<dyn marketplace::Service>,
  pub job_runner: Arc<job::JobRunner>,
  pub checkout_success_url: String,
  pub config: Config,
}

impl Context {
  /// Wires every collaborator from `config`: Postgres-backed
  /// repositories when `DATABASE_URL` is set, in-memory ones otherwise; a
  /// backed cache when `CACHE_URL`/`CACHE_TOKEN` are set, the no-op
  /// otherwise. This is the only place that branches on backend choice —
  /// every downstream call site consumes the trait object, never the
  /// concrete type.
  pub async fn build(config: Config) -> Result<Arc<Context>, sqlx::Error> {
    let events: Arc<dyn events::Service> = Arc::new(events::new_service());
    let cache: Arc<dyn cache::Service> = match &config.cache {
      Some(c) => Arc::new(cache::HttpCache::new(c.url.clone(), c.token.clone())),
      None => Arc::new(cache::NoopCache),
    };
    let crypto_service: Arc<dyn crypto::Service> = Arc::new(crypto::new_service(config.encryption_key));
    let ratelimit_service: Arc<dyn ratelimit::Service> = Arc::new(ratelimit::new_service());
    let marketplace_service: Arc<dyn marketplace::Service> = Arc::new(marketplace::new_service(config.marketplace.base_url.clone()));
    let payment: Arc<dyn checkout::PaymentProvider> = Arc::new(checkout::HttpPaymentProvider::new(&config.payment));

    let (repo, blacklist_repo, steps, users_repo): (
      Arc<dyn repository::DeploymentRepository>,
      Arc<dyn repository::ProviderBlacklistRepository>,
      Arc<dyn repository::JobStepRepository>,
      Arc<dyn users::UserRepository>,
    ) = match &config.database_url {
      Some(url) => {
        let pool = sqlx::postgres::PgPoolOptions::new().max_connections(10).connect(url).await?;
        (
          Arc::new(repository::postgres::PostgresDeploymentRepository::new(pool.clone())),
          Arc::new(repository::postgres::PostgresProviderBlacklistRepository::new(pool.clone())),
          Arc::new(repository::postgres::PostgresJobStepRepository::new(pool.clone())),
          Arc::new(users::postgres::PostgresUserRepository::new(pool)),
        )
      }
      None => (
        Arc::new(repository::InMemoryDeploymentRepository::new()),
        Arc::new(repository::InMemoryProviderBlacklist::new(Vec::new())),
        Arc::new(repository::InMemoryJobStepRepository::new()),
        Arc::new(users::InMemoryUserRepository::new()),
      ),
    };

    let job_runner = job::JobRunner::new(
      marketplace_service.clone(),
      repo.clone(),
      blacklist_repo,
      steps,
      cache.clone(),
      events.clone(),
      users_repo.clone(),
      payment.clone(),
      config.marketplace.api_key.clone(),
      config.deposit_usd,
      config.ibc_denom.clone(),
      config.upstream_llm_key.clone(),
    );
    job_runner.clone().spawn_event_loop();

    Ok(Arc::new(Context {
      repo,
      users: users_repo,
      payment,
      crypto: crypto_service,
      cache,
      events,
      ratelimit: ratelimit_service,
      marketplace: marketplace_service,
      job_runner,
      checkout_success_url: config.checkout_success_url.clone(),
      config,
    }))
  }
}

/// A fully-populated `Config` for tests that never touch `env::var`.
#[cfg(test)]
pub fn test_config() -> Config {
  use crate::config::{CacheConfig, MarketplaceConfig, PaymentConfig};

  Config {
    marketplace: MarketplaceConfig {
      base_url: url::Url::parse("https://console-api.example").unwrap(),
      api_key: "mp-key".to_string(),
    },
    upstream_llm_key: "upstream-key".to_string(),
    encryption_key: [7u8; 32],
    payment: PaymentConfig {
      access_token: "pay-token".to_string(),
      webhook_secret: "whsec_test".to_string(),
      product_id: "prod_1".to_string(),
      sandbox: true,
    },
    cache: None::<CacheConfig>,
    database_url: None,
    http_listen_addr: "127.0.0.1:8080".parse().unwrap(),
    log_level: "info".to_string(),
    ibc_denom: "uakt".to_string(),
    checkout_success_url: "https://app.example/success".to_string(),
    deposit_usd: 10.0,
  }
}
