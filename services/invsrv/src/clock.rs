//! Time source used by the collector, the chunked reader and the consumers
//!
//! Everything that sleeps or stamps a snapshot goes through [`Clock`], so
//! tests can drive elapsed time by hand.
//!
//! Wall-clock time is for display only. Ordering and freshness use the
//! monotonic reading, which an NTP step cannot move backwards.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// When a snapshot was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    /// Wall-clock time, as shown to users
    pub wall: DateTime<Utc>,
    /// Monotonic reading of the clock that produced the stamp
    pub monotonic: Duration,
}

#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock time
    fn now(&self) -> DateTime<Utc>;

    /// Time elapsed since the clock started; never goes backwards
    fn monotonic(&self) -> Duration;

    /// Suspend the calling task for `duration`
    async fn sleep(&self, duration: Duration);

    fn stamp(&self) -> Stamp {
        Stamp {
            wall: self.now(),
            monotonic: self.monotonic(),
        }
    }
}

/// Real clock backed by chrono and tokio timers
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_system_clock_sleeps() {
        let clock = SystemClock::new();
        let start = clock.stamp();
        clock.sleep(Duration::from_secs(20)).await;
        assert!(clock.monotonic() - start.monotonic >= Duration::from_secs(20));
    }
}
