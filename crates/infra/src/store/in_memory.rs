use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use stockbook_accounting::JournalEntry;
use stockbook_core::{BusinessId, MessageId, ReferenceId, ReferenceType, StockHistoryId, WarehouseId};
use stockbook_inventory::{Bucket, StockBuckets, StockHistory, StockKey, sort_chronologically};
use stockbook_outbox::{
    DeliveryFailure, DeliveryState, MessageStatus, NewOutboxMessage, OutboxMessage, OutboxRecord,
};

use super::r#trait::{
    DailyBalance, HistoryFilter, IntegrationEvent, StockStore, StockSummary, StockTx, StoreError,
    StoreResult, SummaryLock, ensure_business,
};

#[derive(Debug, Clone, Default)]
struct BusinessState {
    history: Vec<StockHistory>,
    summaries: BTreeMap<StockKey, StockSummary>,
    daily: BTreeMap<StockKey, BTreeMap<NaiveDate, StockBuckets>>,
    outbox: Vec<OutboxRecord>,
    applied: HashSet<MessageId>,
    journal: Vec<JournalEntry>,
    integration_events: Vec<IntegrationEvent>,
}

impl BusinessState {
    fn has_older_undelivered(&self, message: &OutboxMessage) -> bool {
        self.outbox.iter().any(|o| {
            o.message.reference_type() == message.reference_type()
                && o.message.reference_id() == message.reference_id()
                && o.message.sequence() < message.sequence()
                && o.delivery.status != MessageStatus::Processed
        })
    }

    fn next_claimable(&self, now: chrono::DateTime<Utc>) -> Option<usize> {
        self.outbox
            .iter()
            .enumerate()
            .filter(|(_, r)| r.delivery.is_claimable(now))
            .filter(|(_, r)| !self.has_older_undelivered(&r.message))
            .min_by_key(|(_, r)| r.message.sequence())
            .map(|(index, _)| index)
    }
}

fn poisoned() -> StoreError {
    StoreError::Backend("lock poisoned".to_string())
}

/// In-memory stock store.
///
/// Each business owns one mutex-guarded state; holding it is the business's
/// stock lock. A transaction works on a copy that replaces the state on
/// commit.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryStockStore {
    businesses: RwLock<HashMap<BusinessId, Arc<Mutex<BusinessState>>>>,
    outbox_sequence: AtomicI64,
}

impl InMemoryStockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn business_state(&self, business_id: BusinessId) -> StoreResult<Arc<Mutex<BusinessState>>> {
        {
            let businesses = self.businesses.read().map_err(|_| poisoned())?;
            if let Some(state) = businesses.get(&business_id) {
                return Ok(state.clone());
            }
        }
        let mut businesses = self.businesses.write().map_err(|_| poisoned())?;
        Ok(businesses.entry(business_id).or_default().clone())
    }

    /// Integration events committed for a business, oldest first.
    pub fn integration_events(&self, business_id: BusinessId) -> StoreResult<Vec<IntegrationEvent>> {
        let state = self.business_state(business_id)?;
        let guard = state.lock().map_err(|_| poisoned())?;
        Ok(guard.integration_events.clone())
    }
}

impl StockStore for InMemoryStockStore {
    fn transact<T, E, F>(&self, business_id: BusinessId, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn StockTx) -> Result<T, E>,
        E: From<StoreError>,
    {
        let state = self.business_state(business_id)?;
        let mut guard = state.lock().map_err(|_| poisoned())?;

        let mut tx = InMemoryTx {
            business_id,
            state: guard.clone(),
            outbox_sequence: &self.outbox_sequence,
        };
        let result = work(&mut tx);
        if result.is_ok() {
            *guard = tx.state;
        }
        result
    }

    fn claim_next_message(
        &self,
        business_id: Option<BusinessId>,
        lease: Duration,
    ) -> StoreResult<Option<OutboxRecord>> {
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| StoreError::Backend(format!("invalid lease: {e}")))?;
        let candidates: Vec<Arc<Mutex<BusinessState>>> = match business_id {
            Some(id) => vec![self.business_state(id)?],
            None => {
                let businesses = self.businesses.read().map_err(|_| poisoned())?;
                businesses.values().cloned().collect()
            }
        };

        let now = Utc::now();
        let mut oldest: Option<(i64, Arc<Mutex<BusinessState>>)> = None;
        for state in candidates {
            let guard = state.lock().map_err(|_| poisoned())?;
            let Some(index) = guard.next_claimable(now) else {
                continue;
            };
            let sequence = guard.outbox[index].message.sequence();
            drop(guard);
            if oldest.as_ref().is_none_or(|(best, _)| sequence < *best) {
                oldest = Some((sequence, state));
            }
        }

        let Some((_, state)) = oldest else {
            return Ok(None);
        };
        let mut guard = state.lock().map_err(|_| poisoned())?;
        // Re-evaluated: another worker may have claimed in between.
        let Some(index) = guard.next_claimable(now) else {
            return Ok(None);
        };
        let record = &mut guard.outbox[index];
        record.delivery.claimed_until = Some(now + lease);
        Ok(Some(record.clone()))
    }

    fn record_delivery_failure(
        &self,
        message: &OutboxMessage,
        failure: &DeliveryFailure,
    ) -> StoreResult<()> {
        let state = self.business_state(message.business_id())?;
        let mut guard = state.lock().map_err(|_| poisoned())?;
        let record = guard
            .outbox
            .iter_mut()
            .find(|r| r.message.id() == message.id())
            .ok_or_else(|| StoreError::NotFound(format!("outbox message {}", message.id())))?;
        record.delivery.record_failure(failure);
        Ok(())
    }

    fn undelivered_messages(&self, business_id: BusinessId) -> StoreResult<Vec<OutboxRecord>> {
        let state = self.business_state(business_id)?;
        let guard = state.lock().map_err(|_| poisoned())?;
        Ok(guard
            .outbox
            .iter()
            .filter(|r| r.delivery.status != MessageStatus::Processed)
            .cloned()
            .collect())
    }
}

struct InMemoryTx<'a> {
    business_id: BusinessId,
    state: BusinessState,
    outbox_sequence: &'a AtomicI64,
}

impl InMemoryTx<'_> {
    fn summary_mut(&mut self, key: &StockKey) -> StoreResult<&mut StockSummary> {
        self.state
            .summaries
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(format!("stock summary {key}")))
    }

    fn check_reference_scope(&self, business_id: BusinessId, what: &str) -> StoreResult<()> {
        if business_id != self.business_id {
            return Err(StoreError::TenantIsolation(format!(
                "{what} of business {business_id} written in a transaction of {}",
                self.business_id
            )));
        }
        Ok(())
    }
}

impl StockTx for InMemoryTx<'_> {
    fn business_id(&self) -> BusinessId {
        self.business_id
    }

    fn acquire_stock_lock(&mut self) -> StoreResult<()> {
        // The business mutex is held for the whole transaction.
        Ok(())
    }

    fn lock_summary(&mut self, key: &StockKey) -> StoreResult<SummaryLock> {
        ensure_business(self.business_id, key)?;
        let mut created = false;
        let summary = self.state.summaries.entry(key.clone()).or_insert_with(|| {
            created = true;
            StockSummary {
                key: key.clone(),
                buckets: StockBuckets::default(),
                last_sequence: 0,
                updated_at: Utc::now(),
            }
        });
        Ok(SummaryLock {
            created,
            summary: summary.clone(),
        })
    }

    fn next_cumulative_sequence(&mut self, key: &StockKey) -> StoreResult<i64> {
        let summary = self.summary_mut(key)?;
        summary.last_sequence += 1;
        Ok(summary.last_sequence)
    }

    fn increment_summary(
        &mut self,
        key: &StockKey,
        bucket: Bucket,
        bucket_delta: Decimal,
    ) -> StoreResult<()> {
        let summary = self.summary_mut(key)?;
        summary.buckets.apply(bucket, bucket_delta);
        summary.updated_at = Utc::now();
        Ok(())
    }

    fn increment_daily_balance(
        &mut self,
        key: &StockKey,
        date: NaiveDate,
        bucket: Bucket,
        bucket_delta: Decimal,
    ) -> StoreResult<()> {
        ensure_business(self.business_id, key)?;
        let days = self.state.daily.entry(key.clone()).or_default();
        if !days.contains_key(&date) {
            let seed = days
                .range(..date)
                .next_back()
                .map(|(_, balance)| *balance)
                .unwrap_or_default();
            days.insert(date, seed);
        }
        for (_, balance) in days.range_mut(date..) {
            balance.apply(bucket, bucket_delta);
        }
        Ok(())
    }

    fn insert_history(&mut self, row: &StockHistory) -> StoreResult<()> {
        ensure_business(self.business_id, &row.key)?;
        let duplicate = self.state.history.iter().any(|r| {
            r.id == row.id
                || (r.key == row.key && r.cumulative_sequence == row.cumulative_sequence)
        });
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "stock history {} (sequence {} of {})",
                row.id, row.cumulative_sequence, row.key
            )));
        }
        self.state.history.push(row.clone());
        Ok(())
    }

    fn mark_reversed(&mut self, id: StockHistoryId, reversed_by: StockHistoryId) -> StoreResult<()> {
        let row = self
            .state
            .history
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("stock history {id}")))?;
        if !row.is_valid() {
            return Err(StoreError::Conflict(format!("stock history {id} is already reversed")));
        }
        row.reversed_by_stock_history_id = Some(reversed_by);
        Ok(())
    }

    fn history_for_reference(
        &mut self,
        reference_type: ReferenceType,
        reference_id: ReferenceId,
    ) -> StoreResult<Vec<StockHistory>> {
        let mut rows: Vec<StockHistory> = self
            .state
            .history
            .iter()
            .filter(|r| r.reference_type == reference_type && r.reference_id == reference_id)
            .cloned()
            .collect();
        sort_chronologically(&mut rows);
        Ok(rows)
    }

    fn history_for_key(&mut self, key: &StockKey) -> StoreResult<Vec<StockHistory>> {
        let mut rows: Vec<StockHistory> =
            self.state.history.iter().filter(|r| &r.key == key).cloned().collect();
        sort_chronologically(&mut rows);
        Ok(rows)
    }

    fn history(&mut self, filter: &HistoryFilter) -> StoreResult<Vec<StockHistory>> {
        let mut rows: Vec<StockHistory> = self
            .state
            .history
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (a.stock_date, &a.key, a.cumulative_sequence)
                .cmp(&(b.stock_date, &b.key, b.cumulative_sequence))
        });
        Ok(rows)
    }

    fn summaries(&mut self, warehouse_id: Option<WarehouseId>) -> StoreResult<Vec<StockSummary>> {
        Ok(self
            .state
            .summaries
            .values()
            .filter(|s| warehouse_id.is_none_or(|w| s.key.warehouse_id == w))
            .cloned()
            .collect())
    }

    fn daily_balances_as_of(
        &mut self,
        as_of: NaiveDate,
        warehouse_id: Option<WarehouseId>,
    ) -> StoreResult<Vec<DailyBalance>> {
        Ok(self
            .state
            .daily
            .iter()
            .filter(|(key, _)| warehouse_id.is_none_or(|w| key.warehouse_id == w))
            .filter_map(|(key, days)| {
                days.range(..=as_of).next_back().map(|(date, buckets)| DailyBalance {
                    key: key.clone(),
                    balance_date: *date,
                    buckets: *buckets,
                })
            })
            .collect())
    }

    fn insert_outbox(&mut self, message: NewOutboxMessage) -> StoreResult<OutboxMessage> {
        self.check_reference_scope(message.business_id, "outbox message")?;
        if self.state.outbox.iter().any(|r| r.message.id() == message.id) {
            return Err(StoreError::Conflict(format!("outbox message {}", message.id)));
        }
        let sequence = self.outbox_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();
        let stored = OutboxMessage::from_new(message, sequence, now);
        self.state.outbox.push(OutboxRecord {
            message: stored.clone(),
            delivery: DeliveryState::pending(now),
        });
        Ok(stored)
    }

    fn is_message_applied(&mut self, message_id: MessageId) -> StoreResult<bool> {
        Ok(self.state.applied.contains(&message_id))
    }

    fn record_message_applied(&mut self, message: &OutboxMessage) -> StoreResult<()> {
        self.check_reference_scope(message.business_id(), "applied message")?;
        self.state.applied.insert(message.id());
        if let Some(record) = self
            .state
            .outbox
            .iter_mut()
            .find(|r| r.message.id() == message.id())
        {
            record.delivery.status = MessageStatus::Processed;
            record.delivery.processed_at = Some(Utc::now());
            record.delivery.claimed_until = None;
        }
        Ok(())
    }

    fn insert_journal_entry(&mut self, entry: &JournalEntry) -> StoreResult<()> {
        self.check_reference_scope(entry.business_id, "journal entry")?;
        self.state.journal.push(entry.clone());
        Ok(())
    }

    fn journal_entries_for_reference(
        &mut self,
        reference_type: ReferenceType,
        reference_id: ReferenceId,
    ) -> StoreResult<Vec<JournalEntry>> {
        Ok(self
            .state
            .journal
            .iter()
            .filter(|e| e.reference_type == reference_type && e.reference_id == reference_id)
            .cloned()
            .collect())
    }

    fn insert_integration_event(&mut self, event: &IntegrationEvent) -> StoreResult<()> {
        ensure_business(self.business_id, &event.key)?;
        self.state.integration_events.push(event.clone());
        Ok(())
    }
}
