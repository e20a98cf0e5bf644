//! Staleness policy and the clock it is evaluated against.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

/// Default maximum age before cached data is refetched.
pub const DEFAULT_MAX_AGE_DAYS: i64 = 7;

/// Whether data last fetched at `last_fetched_at` must be refetched at `now`.
///
/// Missing timestamps are always stale. An age exactly equal to `max_age`
/// counts as stale.
pub fn is_stale(
  last_fetched_at: Option<DateTime<Utc>>,
  max_age: Duration,
  now: DateTime<Utc>,
) -> bool {
  match last_fetched_at {
    Some(fetched) => now - fetched >= max_age,
    None => true,
  }
}

/// Fixed max-age staleness policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessPolicy {
  max_age: Duration,
}

impl Default for StalenessPolicy {
  fn default() -> Self {
    Self {
      max_age: Duration::days(DEFAULT_MAX_AGE_DAYS),
    }
  }
}

impl StalenessPolicy {
  pub fn new(max_age: Duration) -> Self {
    Self { max_age }
  }

  pub fn max_age(&self) -> Duration {
    self.max_age
  }

  pub fn is_stale(&self, last_fetched_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    is_stale(last_fetched_at, self.max_age, now)
  }
}

/// Source of "now" for staleness decisions and fetch timestamps.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// Clock that only moves when told to. Used by tests and replays.
#[derive(Debug)]
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new(now: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(now),
    }
  }

  pub fn set(&self, now: DateTime<Utc>) {
    if let Ok(mut guard) = self.now.lock() {
      *guard = now;
    }
  }

  pub fn advance(&self, by: Duration) {
    if let Ok(mut guard) = self.now.lock() {
      *guard += by;
    }
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    match self.now.lock() {
      Ok(guard) => *guard,
      Err(poisoned) => *poisoned.into_inner(),
    }
  }
}
