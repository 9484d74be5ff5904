//! Identity and account linking: the create-or-link-by-email rule for
//! `User`. The only writer of `User` rows.

use crate::domain::User;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[async_trait]
pub trait UserRepository: Send + Sync + 'static {
  async fn find_by_id(&self, id: Uuid) -> Option<User>;
  async fn find_by_external_auth_id(&self, external_auth_id: &str) -> Option<User>;
  async fn find_by_email(&self, email: &str) -> Option<User>;
  async fn create(&self, external_auth_id: Option<String>, email: String) -> User;
  async fn link_external_auth_id(&self, user_id: Uuid, external_auth_id: String) -> Option<User>;
}

/// Resolves a user: look up by `externalAuthId`; if absent, look up by
/// `email` and link rather than duplicate; otherwise create.
pub async fn resolve_user(repo: &dyn UserRepository, external_auth_id: &str, email: &str) -> User {
  if let Some(user) = repo.find_by_external_auth_id(external_auth_id).await {
    return user;
  }
  if let Some(existing) = repo.find_by_email(email).await {
    return repo
      .link_external_auth_id(existing.id, external_auth_id.to_string())
      .await
      .unwrap_or(existing);
  }
  repo.create(Some(external_auth_id.to_string()), email.to_string()).await
}

pub struct InMemoryUserRepository {
  rows: Mutex<HashMap<Uuid, User>>,
}

impl InMemoryUserRepository {
  pub fn new() -> Self {
    InMemoryUserRepository { rows: Mutex::new(HashMap::new()) }
  }
}

impl Default for InMemoryUserRepository {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
  async fn find_by_id(&self, id: Uuid) -> Option<User> {
    self.rows.lock().unwrap().get(&id).cloned()
  }

  async fn find_by_external_auth_id(&self, external_auth_id: &str) -> Option<User> {
    self
      .rows
      .lock()
      .unwrap()
      .values()
      .find(|u| u.external_auth_id.as_deref() == Some(external_auth_id))
      .cloned()
  }

  async fn find_by_email(&self, email: &str) -> Option<User> {
    self.rows.lock().unwrap().values().find(|u| u.email == email).cloned()
  }

  async fn create(&self, external_auth_id: Option<String>, email: String) -> User {
    let user = User {
      id: Uuid::new_v4(),
      external_auth_id,
      email,
      billing_customer_id: None,
      created_at: Utc::now(),
    };
    self.rows.lock().unwrap().insert(user.id, user.clone());
    user
  }

  async fn link_external_auth_id(&self, user_id: Uuid, external_auth_id: String) -> Option<User> {
    let mut guard = self.rows.lock().unwrap();
    let user = guard.get_mut(&user_id)?;
    user.external_auth_id = Some(external_auth_id);
    Some(user.clone())
  }
}

pub mod postgres {
  use super::*;
  use sqlx::{PgPool, Row};

  pub struct PostgresUserRepository {
    pool: PgPool,
  }

  impl PostgresUserRepository {
    pub fn new(pool: PgPool) -> Self {
      PostgresUserRepository { pool }
    }

    fn row_to_user(row: sqlx::postgres::PgRow) -> User {
      User {
        id: row.get("id"),
        external_auth_id: row.get("external_auth_id"),
        email: row.get("email"),
        billing_customer_id: row.get("billing_customer_id"),
        created_at: row.get("created_at"),
      }
    }
  }

  #[async_trait]
  impl UserRepository for PostgresUserRepository {
    async fn find_by_id(&self, id: Uuid) -> Option<User> {
      sqlx::query("SELECT id, external_auth_id, email, billing_customer_id, created_at FROM users WHERE id = $1")
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .ok()
        .flatten()
        .map(Self::row_to_user)
    }

    async fn find_by_external_auth_id(&self, external_auth_id: &str) -> Option<User> {
      sqlx::query("SELECT id, external_auth_id, email, billing_customer_id, created_at FROM users WHERE external_auth_id = $1")
        .bind(external_auth_id)
        .fetch_optional(&self.pool)
        .await
        .ok()
        .flatten()
        .map(Self::row_to_user)
    }

    async fn find_by_email(&self, email: &str) -> Option<User> {
      sqlx::query("SELECT id, external_auth_id, email, billing_customer_id, created_at FROM users WHERE email = $1")
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .ok()
        .flatten()
        .map(Self::row_to_user)
    }

    async fn create(&self, external_auth_id: Option<String>, email: String) -> User {
      let id = Uuid::new_v4();
      let row = sqlx::query(
        r#"INSERT INTO users (id, external_auth_id, email, created_at)
           VALUES ($1, $2, $3, now())
           RETURNING created_at"#,
      )
      .bind(id)
      .bind(&external_auth_id)
      .bind(&email)
      .fetch_one(&self.pool)
      .await
      .expect("insert into users");

      User {
        id,
        external_auth_id,
        email,
        billing_customer_id: None,
        created_at: row.get("created_at"),
      }
    }

    async fn link_external_auth_id(&self, user_id: Uuid, external_auth_id: String) -> Option<User> {
      sqlx::query("UPDATE users SET external_auth_id = $2 WHERE id = $1")
        .bind(user_id)
        .bind(&external_auth_id)
        .execute(&self.pool)
        .await
        .ok()?;
      self.find_by_external_auth_id(&external_auth_id).await
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn creates_a_new_user_on_first_touch() {
    let repo = InMemoryUserRepository::new();
    let user = resolve_user(&repo, "auth0|abc", "a@example.com").await;
    assert_eq!(user.external_auth_id.as_deref(), Some("auth0|abc"));
    assert_eq!(user.email, "a@example.com");
  }

  #[tokio::test]
  async fn returns_the_same_user_on_repeat_auth_id() {
    let repo = InMemoryUserRepository::new();
    let first = resolve_user(&repo, "auth0|abc", "a@example.com").await;
    let second = resolve_user(&repo, "auth0|abc", "a@example.com").await;
    assert_eq!(first.id, second.id);
  }

  #[tokio::test]
  async fn links_an_existing_email_instead_of_duplicating() {
    let repo = InMemoryUserRepository::new();
    let created = repo.create(None, "a@example.com".to_string()).await;
    assert!(created.external_auth_id.is_none());

    let linked = resolve_user(&repo, "auth0|new-id", "a@example.com").await;
    assert_eq!(linked.id, created.id);
    assert_eq!(linked.external_auth_id.as_deref(), Some("auth0|new-id"));

    let all_users_count = {
      let mut seen = std::collections::HashSet::new();
      seen.insert(created.id);
      seen.insert(linked.id);
      seen.len()
    };
    assert_eq!(all_users_count, 1);
  }
}
