//! Cursor store and quota/backoff ledger.
//!
//! Wraps a [`SyncStore`] with the cool-down rules of the distribution
//! feed: a rate-limit rejection blocks the taxpayer until either the
//! cool-down elapses or the cursor moves past the position at which the
//! rejection happened.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{SyncError, SyncResult};
use crate::models::{Nsu, QuotaBlock};
use crate::store::SyncStore;

/// Answer to [`Ledger::is_blocked`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStatus {
    pub blocked: bool,
    pub remaining: Duration,
}

impl BlockStatus {
    pub const CLEAR: BlockStatus = BlockStatus {
        blocked: false,
        remaining: Duration::ZERO,
    };

    /// Minutes left, rounded up, for "try again in N minutes".
    pub fn remaining_minutes(&self) -> u64 {
        self.remaining.as_secs().div_ceil(60)
    }
}

pub struct Ledger {
    store: Arc<dyn SyncStore>,
    clock: Arc<dyn Clock>,
    cooldown: chrono::Duration,
}

impl Ledger {
    pub fn new(store: Arc<dyn SyncStore>, clock: Arc<dyn Clock>, cooldown: chrono::Duration) -> Self {
        Self {
            store,
            clock,
            cooldown,
        }
    }

    pub async fn get_cursor(&self, taxpayer_id: &str) -> SyncResult<Nsu> {
        self.store.get_cursor(taxpayer_id).await
    }

    /// Persist the cursor. Writes even when `nsu` equals the current value.
    pub async fn advance_cursor(&self, taxpayer_id: &str, nsu: Nsu) -> SyncResult<()> {
        debug!(taxpayer = taxpayer_id, nsu = %nsu, "advance cursor");
        self.store
            .advance_cursor(taxpayer_id, nsu, self.clock.now())
            .await
    }

    /// Record a rate-limit rejection at `position`.
    ///
    /// While a block is already active its `rejected_at` stands, so repeated
    /// rejections cannot stretch the cool-down.
    pub async fn record_quota_rejection(&self, taxpayer_id: &str, position: Nsu) -> SyncResult<QuotaBlock> {
        let now = self.clock.now();
        if let Some(existing) = self.store.get_quota_block(taxpayer_id).await? {
            if existing.remaining(now, self.cooldown).is_some() {
                debug!(taxpayer = taxpayer_id, "quota block already active");
                return Ok(existing);
            }
        }

        let block = QuotaBlock {
            taxpayer_id: taxpayer_id.to_string(),
            rejected_at: now,
            position_at_rejection: position,
        };
        self.store.put_quota_block(&block).await?;
        info!(
            taxpayer = taxpayer_id,
            position = %position,
            cooldown_minutes = self.cooldown.num_minutes(),
            "quota rejection recorded"
        );
        Ok(block)
    }

    /// Whether cursor calls for this taxpayer are currently suppressed.
    ///
    /// Expired blocks, and blocks the cursor has already moved past, are
    /// deleted here.
    pub async fn is_blocked(&self, taxpayer_id: &str) -> SyncResult<BlockStatus> {
        let block = match self.store.get_quota_block(taxpayer_id).await? {
            Some(b) => b,
            None => return Ok(BlockStatus::CLEAR),
        };

        let cursor = self.store.get_cursor(taxpayer_id).await?;
        let remaining = block.remaining(self.clock.now(), self.cooldown);
        match remaining {
            Some(left) if cursor <= block.position_at_rejection => Ok(BlockStatus {
                blocked: true,
                remaining: left.to_std().unwrap_or(Duration::ZERO),
            }),
            _ => {
                self.store.clear_quota_block(taxpayer_id).await?;
                Ok(BlockStatus::CLEAR)
            }
        }
    }

    /// Gate for cursor calls: `Err(SyncError::QuotaExceeded)` while blocked.
    pub async fn ensure_unblocked(&self, taxpayer_id: &str) -> SyncResult<()> {
        let status = self.is_blocked(taxpayer_id).await?;
        if !status.blocked {
            return Ok(());
        }
        let position = self
            .store
            .get_quota_block(taxpayer_id)
            .await?
            .map(|b| b.position_at_rejection)
            .unwrap_or(Nsu::ZERO);
        Err(SyncError::QuotaExceeded {
            taxpayer_id: taxpayer_id.to_string(),
            position: position.to_string(),
            retry_after: status.remaining,
        })
    }

    /// Full resync: cursor to zero, quota block and resumable jobs cleared.
    pub async fn reset_all(&self, taxpayer_id: &str) -> SyncResult<()> {
        info!(taxpayer = taxpayer_id, "full resync requested, resetting cursor");
        self.store.reset_all(taxpayer_id, self.clock.now()).await
    }
}
