//! Semantic stock buckets and their arithmetic.
//!
//! `current_qty = opening + received - sale + transfer_in - transfer_out
//! + adjusted_in - adjusted_out`. The committed bucket is a reservation and
//! never moves `current_qty`.

use core::str::FromStr;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockbook_core::{DomainError, ReferenceType};

use crate::history::{MovementFlags, StockHistory};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Opening,
    Received,
    Sale,
    Committed,
    TransferIn,
    TransferOut,
    AdjustedIn,
    AdjustedOut,
}

impl Bucket {
    pub const ALL: [Bucket; 8] = [
        Bucket::Opening,
        Bucket::Received,
        Bucket::Sale,
        Bucket::Committed,
        Bucket::TransferIn,
        Bucket::TransferOut,
        Bucket::AdjustedIn,
        Bucket::AdjustedOut,
    ];

    /// Bucket a movement lands in.
    ///
    /// Reversal rows copy the flags of the row they nullify, so they land in
    /// the same bucket with the opposite sign.
    pub fn classify(reference_type: ReferenceType, flags: MovementFlags) -> Bucket {
        match reference_type {
            ReferenceType::OpeningStock => Bucket::Opening,
            ReferenceType::Bill | ReferenceType::SupplierCredit => Bucket::Received,
            ReferenceType::Invoice | ReferenceType::CreditNote => Bucket::Sale,
            ReferenceType::TransferOrder if flags.is_transfer_in => Bucket::TransferIn,
            ReferenceType::TransferOrder => Bucket::TransferOut,
            ReferenceType::InventoryAdjustment if flags.is_outgoing => Bucket::AdjustedOut,
            ReferenceType::InventoryAdjustment => Bucket::AdjustedIn,
        }
    }

    /// Storage column of the bucket in summary and daily balance tables.
    pub fn column(&self) -> &'static str {
        match self {
            Bucket::Opening => "opening_qty",
            Bucket::Received => "received_qty",
            Bucket::Sale => "sale_qty",
            Bucket::Committed => "committed_qty",
            Bucket::TransferIn => "transfer_in_qty",
            Bucket::TransferOut => "transfer_out_qty",
            Bucket::AdjustedIn => "adjusted_in_qty",
            Bucket::AdjustedOut => "adjusted_out_qty",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Opening => "opening",
            Bucket::Received => "received",
            Bucket::Sale => "sale",
            Bucket::Committed => "committed",
            Bucket::TransferIn => "transfer_in",
            Bucket::TransferOut => "transfer_out",
            Bucket::AdjustedIn => "adjusted_in",
            Bucket::AdjustedOut => "adjusted_out",
        }
    }

    fn direction(&self) -> Decimal {
        match self {
            Bucket::Opening | Bucket::Received | Bucket::TransferIn | Bucket::AdjustedIn => {
                Decimal::ONE
            }
            Bucket::Sale | Bucket::TransferOut | Bucket::AdjustedOut => Decimal::NEGATIVE_ONE,
            Bucket::Committed => Decimal::ZERO,
        }
    }

    /// Bucket delta produced by a signed ledger quantity.
    pub fn delta_for_quantity(&self, signed_qty: Decimal) -> Decimal {
        match self {
            Bucket::Committed => signed_qty,
            _ => signed_qty * self.direction(),
        }
    }

    /// Effect of a bucket delta on `current_qty`.
    pub fn signed_effect(&self, bucket_delta: Decimal) -> Decimal {
        bucket_delta * self.direction()
    }
}

impl FromStr for Bucket {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Bucket::ALL
            .into_iter()
            .find(|b| b.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown bucket: {s}")))
    }
}

/// Running totals for one key (summary row, daily balance, or a report row).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockBuckets {
    pub opening: Decimal,
    pub received: Decimal,
    pub sale: Decimal,
    pub committed: Decimal,
    pub transfer_in: Decimal,
    pub transfer_out: Decimal,
    pub adjusted_in: Decimal,
    pub adjusted_out: Decimal,
    pub current_qty: Decimal,
}

impl StockBuckets {
    pub fn get(&self, bucket: Bucket) -> Decimal {
        match bucket {
            Bucket::Opening => self.opening,
            Bucket::Received => self.received,
            Bucket::Sale => self.sale,
            Bucket::Committed => self.committed,
            Bucket::TransferIn => self.transfer_in,
            Bucket::TransferOut => self.transfer_out,
            Bucket::AdjustedIn => self.adjusted_in,
            Bucket::AdjustedOut => self.adjusted_out,
        }
    }

    fn slot(&mut self, bucket: Bucket) -> &mut Decimal {
        match bucket {
            Bucket::Opening => &mut self.opening,
            Bucket::Received => &mut self.received,
            Bucket::Sale => &mut self.sale,
            Bucket::Committed => &mut self.committed,
            Bucket::TransferIn => &mut self.transfer_in,
            Bucket::TransferOut => &mut self.transfer_out,
            Bucket::AdjustedIn => &mut self.adjusted_in,
            Bucket::AdjustedOut => &mut self.adjusted_out,
        }
    }

    /// `bucket += delta; current_qty += signed_effect(delta)`.
    pub fn apply(&mut self, bucket: Bucket, bucket_delta: Decimal) {
        *self.slot(bucket) += bucket_delta;
        self.current_qty += bucket.signed_effect(bucket_delta);
    }

    /// Fold a ledger row in (callers filter out reversed rows when needed).
    pub fn record(&mut self, row: &StockHistory) {
        let bucket = row.bucket();
        self.apply(bucket, bucket.delta_for_quantity(row.quantity));
    }

    pub fn add(&mut self, other: &StockBuckets) {
        for bucket in Bucket::ALL {
            *self.slot(bucket) += other.get(bucket);
        }
        self.current_qty += other.current_qty;
    }

    /// On-hand implied by the movement buckets alone.
    pub fn derived_on_hand(&self) -> Decimal {
        self.opening + self.received - self.sale + self.transfer_in - self.transfer_out
            + self.adjusted_in
            - self.adjusted_out
    }

    pub fn is_consistent(&self) -> bool {
        self.derived_on_hand() == self.current_qty
    }

    /// Equality of the movement buckets and on-hand, ignoring committed.
    ///
    /// Committed is a reservation with no ledger rows behind it, so a
    /// ledger rebuild cannot reproduce it.
    pub fn same_movements(&self, other: &StockBuckets) -> bool {
        Bucket::ALL
            .into_iter()
            .filter(|b| *b != Bucket::Committed)
            .all(|b| self.get(b) == other.get(b))
            && self.current_qty == other.current_qty
    }
}

/// Rebuild buckets from ledger rows, skipping reversed rows and reversals.
pub fn buckets_from_ledger<'a>(rows: impl IntoIterator<Item = &'a StockHistory>) -> StockBuckets {
    let mut buckets = StockBuckets::default();
    for row in rows.into_iter().filter(|r| r.is_valid()) {
        buckets.record(row);
    }
    buckets
}
