use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use stockbook_accounting::JournalEntry;
use stockbook_core::{BusinessId, MessageId, ReferenceId, ReferenceType, StockHistoryId, WarehouseId};
use stockbook_inventory::{Bucket, ProductKey, StockBuckets, StockHistory, StockKey};
use stockbook_outbox::{DeliveryFailure, NewOutboxMessage, OutboxMessage, OutboxRecord};

/// Stock store operation error.
///
/// These are **infrastructure errors** (storage, locking, isolation) as
/// opposed to domain errors (validation, shortfalls).
///
/// ## Error Categories
///
/// - **Concurrency**: lock timeout, serialization failure or deadlock (transient)
/// - **Conflict**: a uniqueness constraint rejected a write
/// - **NotFound**: a row the operation depends on is missing
/// - **TenantIsolation**: a write targeted a business other than the transaction's
/// - **Backend**: connection or driver failure (transient)
/// - **Serialization**: a stored payload could not be encoded or decoded
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("concurrency failure: {0}")]
    Concurrency(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether retrying the whole transaction may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Concurrency(_) | StoreError::Conflict(_) | StoreError::Backend(_)
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Cached bucket totals of one stock key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockSummary {
    pub key: StockKey,
    pub buckets: StockBuckets,
    /// Last `cumulative_sequence` handed out for the key.
    pub last_sequence: i64,
    pub updated_at: DateTime<Utc>,
}

/// Cumulative bucket totals of one stock key as of the end of `balance_date`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyBalance {
    pub key: StockKey,
    pub balance_date: NaiveDate,
    pub buckets: StockBuckets,
}

/// Result of locating (or creating) and row-locking a summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryLock {
    /// The summary row did not exist before this call.
    pub created: bool,
    pub summary: StockSummary,
}

/// Ledger query used by reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryFilter {
    pub warehouse_id: Option<WarehouseId>,
    pub product: Option<ProductKey>,
    pub from: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
    /// Drop reversal rows and the rows they nullified.
    pub valid_only: bool,
}

impl HistoryFilter {
    pub fn matches(&self, row: &StockHistory) -> bool {
        self.warehouse_id.is_none_or(|w| row.key.warehouse_id == w)
            && self.product.is_none_or(|p| row.key.product == p)
            && self.from.is_none_or(|d| row.stock_date >= d)
            && self.until.is_none_or(|d| row.stock_date <= d)
            && (!self.valid_only || row.is_valid())
    }
}

pub const STOCK_TRACKING_STARTED: &str = "stock.tracking_started";

/// Event raised inside the posting transaction for downstream integrations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationEvent {
    pub id: Uuid,
    pub key: StockKey,
    pub kind: String,
    pub created_at: DateTime<Utc>,
}

impl IntegrationEvent {
    pub fn tracking_started(key: StockKey) -> Self {
        Self {
            id: Uuid::now_v7(),
            key,
            kind: STOCK_TRACKING_STARTED.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// One open, business-scoped stock transaction.
///
/// Every write is rejected with [`StoreError::TenantIsolation`] unless it
/// targets [`StockTx::business_id`]. Nothing is visible to other
/// transactions until the owning [`StockStore::transact`] call commits.
pub trait StockTx {
    fn business_id(&self) -> BusinessId;

    /// Coarse per-business lock, held until the transaction ends.
    fn acquire_stock_lock(&mut self) -> StoreResult<()>;

    /// Locate or create the summary row of `key` and row-lock it.
    fn lock_summary(&mut self, key: &StockKey) -> StoreResult<SummaryLock>;

    /// Atomically advance and return the key's `cumulative_sequence`.
    fn next_cumulative_sequence(&mut self, key: &StockKey) -> StoreResult<i64>;

    /// `bucket += bucket_delta` and `current_qty += bucket.signed_effect(bucket_delta)`
    /// in a single atomic update.
    fn increment_summary(
        &mut self,
        key: &StockKey,
        bucket: Bucket,
        bucket_delta: Decimal,
    ) -> StoreResult<()>;

    /// Same increment applied to the daily balance of `date` and every later
    /// one, seeding `date` from the latest earlier balance when missing.
    fn increment_daily_balance(
        &mut self,
        key: &StockKey,
        date: NaiveDate,
        bucket: Bucket,
        bucket_delta: Decimal,
    ) -> StoreResult<()>;

    fn insert_history(&mut self, row: &StockHistory) -> StoreResult<()>;

    /// Point a valid row at the reversal that nullifies it.
    fn mark_reversed(&mut self, id: StockHistoryId, reversed_by: StockHistoryId) -> StoreResult<()>;

    fn history_for_reference(
        &mut self,
        reference_type: ReferenceType,
        reference_id: ReferenceId,
    ) -> StoreResult<Vec<StockHistory>>;

    /// Every row of `key` in `(stock_date, cumulative_sequence)` order.
    fn history_for_key(&mut self, key: &StockKey) -> StoreResult<Vec<StockHistory>>;

    fn history(&mut self, filter: &HistoryFilter) -> StoreResult<Vec<StockHistory>>;

    fn summaries(&mut self, warehouse_id: Option<WarehouseId>) -> StoreResult<Vec<StockSummary>>;

    /// Latest daily balance on or before `as_of` for every key.
    fn daily_balances_as_of(
        &mut self,
        as_of: NaiveDate,
        warehouse_id: Option<WarehouseId>,
    ) -> StoreResult<Vec<DailyBalance>>;

    fn insert_outbox(&mut self, message: NewOutboxMessage) -> StoreResult<OutboxMessage>;

    fn is_message_applied(&mut self, message_id: MessageId) -> StoreResult<bool>;

    /// Remember the message as applied and mark its outbox row processed.
    fn record_message_applied(&mut self, message: &OutboxMessage) -> StoreResult<()>;

    fn insert_journal_entry(&mut self, entry: &JournalEntry) -> StoreResult<()>;

    fn journal_entries_for_reference(
        &mut self,
        reference_type: ReferenceType,
        reference_id: ReferenceId,
    ) -> StoreResult<Vec<JournalEntry>>;

    fn insert_integration_event(&mut self, event: &IntegrationEvent) -> StoreResult<()>;
}

/// Transactional, business-scoped stock storage.
///
/// ## Transactions
///
/// `transact()` opens a transaction scoped to one business, hands it to
/// `work`, commits when `work` returns `Ok` and rolls back on `Err`. Ledger
/// rows, summaries, daily balances, outbox rows and journal entries written
/// inside are all-or-nothing.
///
/// ## Outbox delivery
///
/// Claiming and failure bookkeeping happen outside posting transactions so
/// that a rolled-back attempt still leaves its failure recorded.
pub trait StockStore: Send + Sync {
    fn transact<T, E, F>(&self, business_id: BusinessId, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn StockTx) -> Result<T, E>,
        E: From<StoreError>;

    /// Lease the oldest claimable message whose reference has no older
    /// undelivered message. `business_id` restricts the claim to one business.
    fn claim_next_message(
        &self,
        business_id: Option<BusinessId>,
        lease: Duration,
    ) -> StoreResult<Option<OutboxRecord>>;

    fn record_delivery_failure(
        &self,
        message: &OutboxMessage,
        failure: &DeliveryFailure,
    ) -> StoreResult<()>;

    /// Pending and dead-lettered messages of a business, oldest first.
    fn undelivered_messages(&self, business_id: BusinessId) -> StoreResult<Vec<OutboxRecord>>;
}

impl<S> StockStore for Arc<S>
where
    S: StockStore,
{
    fn transact<T, E, F>(&self, business_id: BusinessId, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn StockTx) -> Result<T, E>,
        E: From<StoreError>,
    {
        (**self).transact(business_id, work)
    }

    fn claim_next_message(
        &self,
        business_id: Option<BusinessId>,
        lease: Duration,
    ) -> StoreResult<Option<OutboxRecord>> {
        (**self).claim_next_message(business_id, lease)
    }

    fn record_delivery_failure(
        &self,
        message: &OutboxMessage,
        failure: &DeliveryFailure,
    ) -> StoreResult<()> {
        (**self).record_delivery_failure(message, failure)
    }

    fn undelivered_messages(&self, business_id: BusinessId) -> StoreResult<Vec<OutboxRecord>> {
        (**self).undelivered_messages(business_id)
    }
}

/// Reject writes to keys outside the transaction's business.
pub(crate) fn ensure_business(tx_business: BusinessId, key: &StockKey) -> StoreResult<()> {
    if key.business_id != tx_business {
        return Err(StoreError::TenantIsolation(format!(
            "key {key} does not belong to business {tx_business}"
        )));
    }
    Ok(())
}
