//! In-process sliding-window admission oracle. The core only ever consumes
//! the `admit` interface; a distributed counter could replace
//! `Implementation` without touching a caller.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct Admission {
  pub allowed: bool,
  pub retry_after: Option<Duration>,
}

pub trait Service: Send + Sync + 'static {
  fn admit(&self, key: &str, limit: u32, window: Duration) -> Admission;
}

struct Implementation {
  // key -> timestamps of admitted requests still inside some past window.
  windows: Mutex<HashMap<String, Vec<Instant>>>,
}

pub fn new_service() -> impl Service {
  Implementation {
    windows: Mutex::new(HashMap::new()),
  }
}

impl Service for Implementation {
  fn admit(&self, key: &str, limit: u32, window: Duration) -> Admission {
    let now = Instant::now();
    let mut guard = self.windows.lock().unwrap();
    let timestamps = guard.entry(key.to_string()).or_insert_with(Vec::new);
    timestamps.retain(|t| now.duration_since(*t) < window);

    if (timestamps.len() as u32) < limit {
      timestamps.push(now);
      Admission {
        allowed: true,
        retry_after: None,
      }
    } else {
      let oldest = timestamps.iter().min().copied().unwrap_or(now);
      let retry_after = window.saturating_sub(now.duration_since(oldest));
      Admission {
        allowed: false,
        retry_after: Some(retry_after),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn admits_up_to_the_limit_then_rejects() {
    let svc = new_service();
    let window = Duration::from_secs(60);
    assert!(svc.admit("actor:/checkout", 2, window).allowed);
    assert!(svc.admit("actor:/checkout", 2, window).allowed);
    let third = svc.admit("actor:/checkout", 2, window);
    assert!(!third.allowed);
    assert!(third.retry_after.is_some());
  }

  #[test]
  fn keys_are_independent() {
    let svc = new_service();
    let window = Duration::from_secs(60);
    assert!(svc.admit("a", 1, window).allowed);
    assert!(svc.admit("b", 1, window).allowed);
    assert!(!svc.admit("a", 1, window).allowed);
  }
}
