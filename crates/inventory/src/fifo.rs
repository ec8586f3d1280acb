//! FIFO cost layers.
//!
//! A [`FifoBook`] is rebuilt per stock key by replaying valid ledger rows in
//! chronological order. Receipts open layers; issues consume the oldest
//! layer first; a negative correction of a receipt withdraws from the
//! layers that receipt opened.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

use stockbook_core::{DetailId, ReferenceId};

use crate::history::StockHistory;

/// Document line a layer was opened by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerOrigin {
    pub reference_id: ReferenceId,
    pub detail_id: DetailId,
}

impl LayerOrigin {
    pub fn of(row: &StockHistory) -> Self {
        Self {
            reference_id: row.reference_id,
            detail_id: row.reference_detail_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostLayer {
    pub date: NaiveDate,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    pub origin: LayerOrigin,
}

/// Quantity taken from (or put back into) a layer at its unit cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostSlice {
    pub quantity: Decimal,
    pub unit_cost: Decimal,
}

impl CostSlice {
    pub fn value(&self) -> Decimal {
        self.quantity * self.unit_cost
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("only {available} in cost layers, {requested} requested")]
pub struct InsufficientLayers {
    pub available: Decimal,
    pub requested: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FifoBook {
    layers: VecDeque<CostLayer>,
    /// Quantity issued beyond the available layers (historic negative stock).
    deficit: Decimal,
}

impl FifoBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay rows that are already in chronological order; invalid rows
    /// (reversed or reversals) are skipped.
    pub fn from_rows<'a>(rows: impl IntoIterator<Item = &'a StockHistory>) -> Self {
        let mut book = Self::new();
        for row in rows.into_iter().filter(|r| r.is_valid()) {
            book.apply_row(row);
        }
        book
    }

    /// Fold one row in and return the slices it consumed.
    pub fn apply_row(&mut self, row: &StockHistory) -> Vec<CostSlice> {
        if row.quantity > Decimal::ZERO {
            self.receive(CostLayer {
                date: row.stock_date,
                quantity: row.quantity,
                unit_cost: row.base_unit_value,
                origin: LayerOrigin::of(row),
            });
            Vec::new()
        } else if row.quantity < Decimal::ZERO {
            if row.flags.is_outgoing {
                self.take_oldest(-row.quantity)
            } else {
                self.withdraw(LayerOrigin::of(row), -row.quantity)
            }
        } else {
            Vec::new()
        }
    }

    pub fn receive(&mut self, mut layer: CostLayer) {
        if self.deficit > Decimal::ZERO {
            let covered = self.deficit.min(layer.quantity);
            self.deficit -= covered;
            layer.quantity -= covered;
        }
        if layer.quantity > Decimal::ZERO {
            self.layers.push_back(layer);
        }
    }

    /// Consume `quantity` from the oldest layers, failing without side
    /// effects when the layers do not cover it.
    pub fn consume(&mut self, quantity: Decimal) -> Result<Vec<CostSlice>, InsufficientLayers> {
        let available = self.quantity();
        if available < quantity {
            return Err(InsufficientLayers {
                available,
                requested: quantity,
            });
        }
        Ok(self.take_oldest(quantity))
    }

    /// Remove `quantity` from layers opened by `origin` (newest first), then
    /// from the oldest layers.
    pub fn withdraw(&mut self, origin: LayerOrigin, quantity: Decimal) -> Vec<CostSlice> {
        let mut remaining = quantity;
        let mut slices = Vec::new();

        for idx in (0..self.layers.len()).rev() {
            if remaining.is_zero() {
                break;
            }
            let layer = &mut self.layers[idx];
            if layer.origin != origin {
                continue;
            }
            let taken = remaining.min(layer.quantity);
            layer.quantity -= taken;
            remaining -= taken;
            slices.push(CostSlice {
                quantity: taken,
                unit_cost: layer.unit_cost,
            });
        }
        self.layers.retain(|l| !l.quantity.is_zero());

        if remaining > Decimal::ZERO {
            slices.extend(self.take_oldest(remaining));
        }
        slices
    }

    fn take_oldest(&mut self, quantity: Decimal) -> Vec<CostSlice> {
        let mut remaining = quantity;
        let mut slices = Vec::new();

        while remaining > Decimal::ZERO {
            let Some(front) = self.layers.front_mut() else {
                self.deficit += remaining;
                break;
            };
            let taken = remaining.min(front.quantity);
            front.quantity -= taken;
            remaining -= taken;
            slices.push(CostSlice {
                quantity: taken,
                unit_cost: front.unit_cost,
            });
            if front.quantity.is_zero() {
                self.layers.pop_front();
            }
        }
        slices
    }

    pub fn quantity(&self) -> Decimal {
        self.layers.iter().map(|l| l.quantity).sum::<Decimal>() - self.deficit
    }

    pub fn value(&self) -> Decimal {
        self.layers.iter().map(|l| l.quantity * l.unit_cost).sum()
    }

    pub fn layers(&self) -> impl Iterator<Item = &CostLayer> {
        self.layers.iter()
    }
}
