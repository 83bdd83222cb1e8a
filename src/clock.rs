//! Time source shared by the queue, the TTL cache and the response store.

use chrono::{DateTime, Utc};

/// Source of "now". Injected so expiry can be tested without sleeping.
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

#[cfg(test)]
pub use manual::ManualClock;
