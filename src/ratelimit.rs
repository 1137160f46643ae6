//! Rate limiter for the by-key query path.
//!
//! The authority tolerates only a small number of single-key queries per
//! taxpayer per hour. Call times are kept in the store so the window
//! survives restarts; spacing between consecutive calls is enforced by
//! sleeping.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::clock::Clock;
use crate::config::BackfillConfig;
use crate::error::SyncResult;
use crate::store::SyncStore;

/// Result of asking for a by-key call slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    /// Hourly budget used up; the oldest call leaves the window after `retry_after`.
    Exhausted { retry_after: Duration },
}

pub struct KeyRateLimiter {
    store: Arc<dyn SyncStore>,
    clock: Arc<dyn Clock>,
    max_per_hour: u32,
    min_interval: Duration,
}

impl KeyRateLimiter {
    pub fn new(
        store: Arc<dyn SyncStore>,
        clock: Arc<dyn Clock>,
        max_per_hour: u32,
        min_interval: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            max_per_hour,
            min_interval,
        }
    }

    pub fn from_config(
        store: Arc<dyn SyncStore>,
        clock: Arc<dyn Clock>,
        config: &BackfillConfig,
    ) -> Self {
        Self::new(
            store,
            clock,
            config.max_per_hour,
            Duration::from_millis(config.min_interval_ms),
        )
    }

    /// Take a slot for one by-key call, waiting out the minimum spacing.
    ///
    /// A granted slot is recorded immediately, so the call counts against
    /// the window even if it then fails.
    pub async fn acquire(&self, taxpayer_id: &str) -> SyncResult<Admission> {
        let window = chrono::Duration::hours(1);
        let now = self.clock.now();
        self.store.prune_key_lookups(now - window).await?;

        let calls = self.store.key_lookups_since(taxpayer_id, now - window).await?;
        if calls.len() as u64 >= u64::from(self.max_per_hour) {
            let retry_after = calls
                .first()
                .map(|oldest| (*oldest + window - now).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(Duration::ZERO);
            debug!(taxpayer = taxpayer_id, calls = calls.len(), "by-key budget exhausted");
            return Ok(Admission::Exhausted { retry_after });
        }

        if let Some(last) = calls.last() {
            let since_last = (now - *last).to_std().unwrap_or(Duration::ZERO);
            if since_last < self.min_interval {
                tokio::time::sleep(self.min_interval - since_last).await;
            }
        }

        self.store
            .record_key_lookup(taxpayer_id, self.clock.now())
            .await?;
        Ok(Admission::Granted)
    }

    /// Calls left in the current window.
    pub async fn remaining(&self, taxpayer_id: &str) -> SyncResult<u32> {
        let now = self.clock.now();
        let used = self
            .store
            .key_lookups_since(taxpayer_id, now - chrono::Duration::hours(1))
            .await?
            .len() as u32;
        Ok(self.max_per_hour.saturating_sub(used))
    }
}
