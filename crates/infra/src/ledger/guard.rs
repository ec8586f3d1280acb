use std::collections::BTreeSet;
use tracing::debug;

use stockbook_inventory::StockKey;

use super::cache::StockCacheUpdater;
use crate::store::{StockTx, StoreResult};

/// Two-layer locking for stock writes.
///
/// 1. The business-wide stock lock, taken first by every posting.
/// 2. Summary row locks of the affected keys, always taken in key order so
///    two postings touching the same keys cannot deadlock.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyGuard {
    cache: StockCacheUpdater,
}

impl ConcurrencyGuard {
    pub fn new(cache: StockCacheUpdater) -> Self {
        Self { cache }
    }

    pub fn lock_business(&self, tx: &mut dyn StockTx) -> StoreResult<()> {
        tx.acquire_stock_lock()?;
        debug!(business_id = %tx.business_id(), "stock lock acquired");
        Ok(())
    }

    pub fn lock_keys<'a>(
        &self,
        tx: &mut dyn StockTx,
        keys: impl IntoIterator<Item = &'a StockKey>,
    ) -> StoreResult<()> {
        let ordered: BTreeSet<&StockKey> = keys.into_iter().collect();
        for key in ordered {
            self.cache.lock(tx, key)?;
        }
        Ok(())
    }
}
