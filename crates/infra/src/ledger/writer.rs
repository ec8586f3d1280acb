use chrono::Utc;
use tracing::debug;

use stockbook_core::StockHistoryId;
use stockbook_inventory::{NewMovement, PostingPlan, StockHistory};

use super::cache::StockCacheUpdater;
use crate::store::{StockTx, StoreResult};

/// Rows written for one plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanOutcome {
    pub reversed: usize,
    pub posted: usize,
}

/// Appends `StockHistory` rows and keeps the cache in step.
///
/// Rows are never updated except for `reversed_by_stock_history_id`, which
/// links a row to the reversal that nullifies it.
#[derive(Debug, Clone, Default)]
pub struct LedgerWriter {
    cache: StockCacheUpdater,
}

impl LedgerWriter {
    pub fn new(cache: StockCacheUpdater) -> Self {
        Self { cache }
    }

    /// Append one movement: cache increments, next per-key sequence, row.
    pub fn post(&self, tx: &mut dyn StockTx, movement: NewMovement) -> StoreResult<StockHistoryId> {
        self.cache.record_movement(tx, &movement)?;
        let sequence = tx.next_cumulative_sequence(&movement.key)?;

        let id = StockHistoryId::new();
        let reverses = movement.reverses;
        let row = movement.into_row(id, sequence, Utc::now());
        tx.insert_history(&row)?;
        if let Some(original) = reverses {
            tx.mark_reversed(original, id)?;
        }

        debug!(
            stock_history_id = %id,
            key = %row.key,
            quantity = %row.quantity,
            cumulative_sequence = sequence,
            is_reversal = row.is_reversal,
            "stock history appended"
        );
        Ok(id)
    }

    /// Nullify `original` with an offsetting row.
    pub fn reverse(&self, tx: &mut dyn StockTx, original: &StockHistory) -> StoreResult<StockHistoryId> {
        self.post(tx, NewMovement::reversal_of(original))
    }

    /// Write a plan: reversals first, then new movements.
    pub fn apply_plan(&self, tx: &mut dyn StockTx, plan: PostingPlan) -> StoreResult<PlanOutcome> {
        let mut outcome = PlanOutcome::default();
        for original in &plan.reversals {
            self.reverse(tx, original)?;
            outcome.reversed += 1;
        }
        for movement in plan.movements {
            self.post(tx, movement)?;
            outcome.posted += 1;
        }
        Ok(outcome)
    }
}
