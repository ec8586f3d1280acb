use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use stockbook_inventory::{Bucket, NewMovement, StockKey};

use crate::store::{IntegrationEvent, StockTx, StoreResult, SummaryLock};

/// Called inside the posting transaction when a stock key is first seen.
pub trait StockIntegrationHook: Send + Sync {
    fn stock_tracking_started(&self, tx: &mut dyn StockTx, key: &StockKey) -> StoreResult<()>;
}

/// Default hook: persist a `stock.tracking_started` integration event.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecordIntegrationEvent;

impl StockIntegrationHook for RecordIntegrationEvent {
    fn stock_tracking_started(&self, tx: &mut dyn StockTx, key: &StockKey) -> StoreResult<()> {
        tx.insert_integration_event(&IntegrationEvent::tracking_started(key.clone()))
    }
}

/// Maintains `StockSummary` and its daily balances.
///
/// One operation per bucket. Each locates (or creates) the summary row, then
/// applies a single atomic increment to the summary and to the daily balances
/// from the movement's date onward.
#[derive(Clone)]
pub struct StockCacheUpdater {
    hook: Arc<dyn StockIntegrationHook>,
}

impl fmt::Debug for StockCacheUpdater {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StockCacheUpdater").finish_non_exhaustive()
    }
}

impl Default for StockCacheUpdater {
    fn default() -> Self {
        Self::new(Arc::new(RecordIntegrationEvent))
    }
}

impl StockCacheUpdater {
    pub fn new(hook: Arc<dyn StockIntegrationHook>) -> Self {
        Self { hook }
    }

    /// Locate or create the summary of `key` and row-lock it.
    pub fn lock(&self, tx: &mut dyn StockTx, key: &StockKey) -> StoreResult<SummaryLock> {
        let lock = tx.lock_summary(key)?;
        if lock.created {
            info!(key = %key, "stock tracking started");
            self.hook.stock_tracking_started(tx, key)?;
        }
        Ok(lock)
    }

    pub fn add_opening(&self, tx: &mut dyn StockTx, key: &StockKey, date: NaiveDate, delta: Decimal) -> StoreResult<()> {
        self.increment(tx, key, date, Bucket::Opening, delta)
    }

    pub fn add_received(&self, tx: &mut dyn StockTx, key: &StockKey, date: NaiveDate, delta: Decimal) -> StoreResult<()> {
        self.increment(tx, key, date, Bucket::Received, delta)
    }

    pub fn add_sale(&self, tx: &mut dyn StockTx, key: &StockKey, date: NaiveDate, delta: Decimal) -> StoreResult<()> {
        self.increment(tx, key, date, Bucket::Sale, delta)
    }

    /// Reservations only; `current_qty` is unaffected.
    pub fn add_committed(&self, tx: &mut dyn StockTx, key: &StockKey, date: NaiveDate, delta: Decimal) -> StoreResult<()> {
        self.increment(tx, key, date, Bucket::Committed, delta)
    }

    pub fn add_transfer_in(&self, tx: &mut dyn StockTx, key: &StockKey, date: NaiveDate, delta: Decimal) -> StoreResult<()> {
        self.increment(tx, key, date, Bucket::TransferIn, delta)
    }

    pub fn add_transfer_out(&self, tx: &mut dyn StockTx, key: &StockKey, date: NaiveDate, delta: Decimal) -> StoreResult<()> {
        self.increment(tx, key, date, Bucket::TransferOut, delta)
    }

    pub fn add_adjusted_in(&self, tx: &mut dyn StockTx, key: &StockKey, date: NaiveDate, delta: Decimal) -> StoreResult<()> {
        self.increment(tx, key, date, Bucket::AdjustedIn, delta)
    }

    pub fn add_adjusted_out(&self, tx: &mut dyn StockTx, key: &StockKey, date: NaiveDate, delta: Decimal) -> StoreResult<()> {
        self.increment(tx, key, date, Bucket::AdjustedOut, delta)
    }

    /// Route a ledger movement to its bucket operation.
    pub fn record_movement(&self, tx: &mut dyn StockTx, movement: &NewMovement) -> StoreResult<()> {
        let bucket = movement.bucket();
        let delta = bucket.delta_for_quantity(movement.quantity);
        let (key, date) = (&movement.key, movement.stock_date);
        match bucket {
            Bucket::Opening => self.add_opening(tx, key, date, delta),
            Bucket::Received => self.add_received(tx, key, date, delta),
            Bucket::Sale => self.add_sale(tx, key, date, delta),
            Bucket::Committed => self.add_committed(tx, key, date, delta),
            Bucket::TransferIn => self.add_transfer_in(tx, key, date, delta),
            Bucket::TransferOut => self.add_transfer_out(tx, key, date, delta),
            Bucket::AdjustedIn => self.add_adjusted_in(tx, key, date, delta),
            Bucket::AdjustedOut => self.add_adjusted_out(tx, key, date, delta),
        }
    }

    fn increment(
        &self,
        tx: &mut dyn StockTx,
        key: &StockKey,
        date: NaiveDate,
        bucket: Bucket,
        delta: Decimal,
    ) -> StoreResult<()> {
        if delta.is_zero() {
            return Ok(());
        }
        self.lock(tx, key)?;
        tx.increment_summary(key, bucket, delta)?;
        tx.increment_daily_balance(key, date, bucket, delta)?;
        debug!(key = %key, bucket = bucket.as_str(), %delta, %date, "stock cache updated");
        Ok(())
    }
}
