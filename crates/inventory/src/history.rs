use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockbook_core::{DetailId, ReferenceId, ReferenceType, StockHistoryId};

use crate::bucket::Bucket;
use crate::key::StockKey;

/// Direction flags carried by every ledger row.
///
/// The signed quantity alone cannot tell a transfer leg from a plain receipt
/// or issue, nor a returned issue from a receipt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MovementFlags {
    pub is_outgoing: bool,
    pub is_transfer_in: bool,
}

impl MovementFlags {
    pub const RECEIPT: MovementFlags = MovementFlags {
        is_outgoing: false,
        is_transfer_in: false,
    };
    pub const ISSUE: MovementFlags = MovementFlags {
        is_outgoing: true,
        is_transfer_in: false,
    };
    pub const TRANSFER_IN: MovementFlags = MovementFlags {
        is_outgoing: false,
        is_transfer_in: true,
    };
}

/// An immutable ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockHistory {
    pub id: StockHistoryId,
    pub key: StockKey,
    pub stock_date: NaiveDate,
    /// Positive = stock in, negative = stock out.
    pub quantity: Decimal,
    pub base_unit_value: Decimal,
    pub reference_type: ReferenceType,
    pub reference_id: ReferenceId,
    pub reference_detail_id: DetailId,
    /// Per-key posting order, strictly increasing.
    pub cumulative_sequence: i64,
    pub flags: MovementFlags,
    pub is_reversal: bool,
    pub reversed_by_stock_history_id: Option<StockHistoryId>,
    pub created_at: DateTime<Utc>,
}

impl StockHistory {
    /// Neither a reversal nor superseded by one.
    pub fn is_valid(&self) -> bool {
        !self.is_reversal && self.reversed_by_stock_history_id.is_none()
    }

    /// Contribution to asset value.
    pub fn value(&self) -> Decimal {
        self.quantity * self.base_unit_value
    }

    pub fn bucket(&self) -> Bucket {
        Bucket::classify(self.reference_type, self.flags)
    }

    /// Ordering used for FIFO and as-of replay.
    pub fn chronological_key(&self) -> (NaiveDate, i64) {
        (self.stock_date, self.cumulative_sequence)
    }
}

/// Sort rows into replay order.
pub fn sort_chronologically(rows: &mut [StockHistory]) {
    rows.sort_by_key(StockHistory::chronological_key);
}

/// Input of the ledger writer: one signed movement to append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMovement {
    pub key: StockKey,
    pub stock_date: NaiveDate,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    pub reference_type: ReferenceType,
    pub reference_id: ReferenceId,
    pub detail_id: DetailId,
    pub flags: MovementFlags,
    /// Set when this movement nullifies an earlier row.
    pub reverses: Option<StockHistoryId>,
}

impl NewMovement {
    /// The offsetting movement for `original`: same key, date, cost and flags,
    /// negated quantity.
    pub fn reversal_of(original: &StockHistory) -> Self {
        Self {
            key: original.key.clone(),
            stock_date: original.stock_date,
            quantity: -original.quantity,
            unit_cost: original.base_unit_value,
            reference_type: original.reference_type,
            reference_id: original.reference_id,
            detail_id: original.reference_detail_id,
            flags: original.flags,
            reverses: Some(original.id),
        }
    }

    pub fn bucket(&self) -> Bucket {
        Bucket::classify(self.reference_type, self.flags)
    }

    pub fn into_row(
        self,
        id: StockHistoryId,
        cumulative_sequence: i64,
        created_at: DateTime<Utc>,
    ) -> StockHistory {
        StockHistory {
            id,
            key: self.key,
            stock_date: self.stock_date,
            quantity: self.quantity,
            base_unit_value: self.unit_cost,
            reference_type: self.reference_type,
            reference_id: self.reference_id,
            reference_detail_id: self.detail_id,
            cumulative_sequence,
            flags: self.flags,
            is_reversal: self.reverses.is_some(),
            reversed_by_stock_history_id: None,
            created_at,
        }
    }
}
