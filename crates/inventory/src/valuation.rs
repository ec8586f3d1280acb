//! FIFO valuation over ledger rows.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use stockbook_core::{ReferenceId, ReferenceType, WarehouseId};

use crate::fifo::{CostLayer, CostSlice, FifoBook};
use crate::history::StockHistory;
use crate::key::{ProductKey, StockKey};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValuationTotals {
    pub stock_on_hand: Decimal,
    pub asset_value: Decimal,
}

impl ValuationTotals {
    pub fn add_row(&mut self, row: &StockHistory) {
        self.stock_on_hand += row.quantity;
        self.asset_value += row.value();
    }
}

/// `Σqty` and `Σ(qty × unit_cost)` over valid rows dated on or before `as_of`.
pub fn totals_as_of<'a>(
    rows: impl IntoIterator<Item = &'a StockHistory>,
    as_of: NaiveDate,
) -> ValuationTotals {
    let mut totals = ValuationTotals::default();
    for row in rows.into_iter().filter(|r| r.is_valid() && r.stock_date <= as_of) {
        totals.add_row(row);
    }
    totals
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub stock_date: NaiveDate,
    pub warehouse_id: WarehouseId,
    pub batch_number: String,
    pub reference_type: ReferenceType,
    pub reference_id: ReferenceId,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    pub value: Decimal,
    /// Layers an outgoing row drew from.
    pub consumed: Vec<CostSlice>,
    pub running_quantity: Decimal,
    pub running_value: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemainingLayer {
    pub warehouse_id: WarehouseId,
    pub batch_number: String,
    pub layer: CostLayer,
}

/// FIFO layer trace of one product between two dates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuationTrace {
    pub product: ProductKey,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub opening: ValuationTotals,
    pub entries: Vec<TraceEntry>,
    pub closing: ValuationTotals,
    pub closing_layers: Vec<RemainingLayer>,
}

/// Replay valid rows of `product` (all warehouses/batches supplied) and
/// record every movement dated within `[from, to]`.
pub fn trace(
    product: ProductKey,
    rows: &[StockHistory],
    from: NaiveDate,
    to: NaiveDate,
) -> ValuationTrace {
    let mut ordered: Vec<&StockHistory> = rows
        .iter()
        .filter(|r| r.is_valid() && r.key.product == product && r.stock_date <= to)
        .collect();
    // Same order the planner consumed layers in; wall-clock time plays no part.
    ordered.sort_by(|a, b| {
        (a.stock_date, &a.key, a.cumulative_sequence).cmp(&(b.stock_date, &b.key, b.cumulative_sequence))
    });

    let mut books: BTreeMap<StockKey, FifoBook> = BTreeMap::new();
    let mut opening = ValuationTotals::default();
    let mut running = ValuationTotals::default();
    let mut entries = Vec::new();

    for row in ordered {
        let consumed = books.entry(row.key.clone()).or_default().apply_row(row);
        running.add_row(row);
        if row.stock_date < from {
            opening = running;
            continue;
        }
        entries.push(TraceEntry {
            stock_date: row.stock_date,
            warehouse_id: row.key.warehouse_id,
            batch_number: row.key.batch_number.clone(),
            reference_type: row.reference_type,
            reference_id: row.reference_id,
            quantity: row.quantity,
            unit_cost: row.base_unit_value,
            value: row.value(),
            consumed,
            running_quantity: running.stock_on_hand,
            running_value: running.asset_value,
        });
    }

    let closing_layers = books
        .iter()
        .flat_map(|(key, book)| {
            book.layers().map(move |layer| RemainingLayer {
                warehouse_id: key.warehouse_id,
                batch_number: key.batch_number.clone(),
                layer: layer.clone(),
            })
        })
        .collect();

    ValuationTrace {
        product,
        from,
        to,
        opening,
        entries,
        closing: running,
        closing_layers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use stockbook_core::{BusinessId, DetailId, ProductId, StockHistoryId};

    use crate::history::MovementFlags;

    fn dec(v: i64) -> Decimal {
        Decimal::from(v)
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 4, d).unwrap()
    }

    fn row(
        key: &StockKey,
        seq: i64,
        d: u32,
        qty: i64,
        cost: i64,
        reference_type: ReferenceType,
        flags: MovementFlags,
        reference_id: ReferenceId,
    ) -> StockHistory {
        StockHistory {
            id: StockHistoryId::new(),
            key: key.clone(),
            stock_date: day(d),
            quantity: dec(qty),
            base_unit_value: dec(cost),
            reference_type,
            reference_id,
            reference_detail_id: DetailId::new(),
            cumulative_sequence: seq,
            flags,
            is_reversal: false,
            reversed_by_stock_history_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn transfer_keeps_asset_value_and_cost_layer() {
        let business = BusinessId::new();
        let product = ProductKey::single(ProductId::new());
        let w1 = StockKey::untracked(business, WarehouseId::new(), product);
        let w2 = w1.in_warehouse(WarehouseId::new());
        let order = ReferenceId::new();

        let rows = vec![
            row(&w1, 1, 1, 100, 50, ReferenceType::OpeningStock, MovementFlags::RECEIPT, ReferenceId::new()),
            row(&w1, 2, 3, -10, 50, ReferenceType::TransferOrder, MovementFlags::ISSUE, order),
            row(&w2, 1, 3, 10, 50, ReferenceType::TransferOrder, MovementFlags::TRANSFER_IN, order),
        ];

        let totals = totals_as_of(&rows, day(30));
        assert_eq!(totals.stock_on_hand, dec(100));
        assert_eq!(totals.asset_value, dec(5000));

        let trace = trace(product, &rows, day(2), day(30));
        assert_eq!(trace.opening.stock_on_hand, dec(100));
        assert_eq!(trace.entries.len(), 2);
        assert_eq!(trace.closing.asset_value, dec(5000));
        let w2_layer = trace
            .closing_layers
            .iter()
            .find(|l| l.warehouse_id == w2.warehouse_id)
            .unwrap();
        assert_eq!(w2_layer.layer.unit_cost, dec(50));
    }

    #[test]
    fn reversed_rows_are_not_counted() {
        let key = StockKey::untracked(BusinessId::new(), WarehouseId::new(), ProductKey::single(ProductId::new()));
        let mut original = row(&key, 1, 1, 10, 5, ReferenceType::Bill, MovementFlags::RECEIPT, ReferenceId::new());
        let mut reversal = original.clone();
        reversal.id = StockHistoryId::new();
        reversal.quantity = dec(-10);
        reversal.is_reversal = true;
        reversal.cumulative_sequence = 2;
        original.reversed_by_stock_history_id = Some(reversal.id);

        let totals = totals_as_of(&[original.clone(), reversal.clone()], day(30));
        assert_eq!(totals, ValuationTotals::default());

        let trace = trace(key.product, &[original, reversal], day(1), day(30));
        assert!(trace.entries.is_empty());
    }

    #[test]
    fn outgoing_entries_show_consumed_layers() {
        let key = StockKey::untracked(BusinessId::new(), WarehouseId::new(), ProductKey::single(ProductId::new()));
        let rows = vec![
            row(&key, 1, 1, 5, 10, ReferenceType::Bill, MovementFlags::RECEIPT, ReferenceId::new()),
            row(&key, 2, 2, 5, 20, ReferenceType::Bill, MovementFlags::RECEIPT, ReferenceId::new()),
            row(&key, 3, 3, -5, 10, ReferenceType::Invoice, MovementFlags::ISSUE, ReferenceId::new()),
        ];

        let trace = trace(key.product, &rows, day(3), day(3));
        assert_eq!(trace.entries.len(), 1);
        assert_eq!(
            trace.entries[0].consumed,
            vec![CostSlice { quantity: dec(5), unit_cost: dec(10) }]
        );
        assert_eq!(trace.closing.asset_value, dec(100));
    }

    #[test]
    fn same_day_rows_replay_in_sequence_order_regardless_of_clock() {
        let key = StockKey::untracked(BusinessId::new(), WarehouseId::new(), ProductKey::single(ProductId::new()));
        let mut first = row(&key, 1, 1, 5, 10, ReferenceType::Bill, MovementFlags::RECEIPT, ReferenceId::new());
        let second = row(&key, 2, 1, 5, 20, ReferenceType::Bill, MovementFlags::RECEIPT, ReferenceId::new());
        let mut issue = row(&key, 3, 1, -5, 10, ReferenceType::Invoice, MovementFlags::ISSUE, ReferenceId::new());
        // A worker with a fast clock wrote the first receipt.
        first.created_at = second.created_at + Duration::hours(1);
        issue.created_at = first.created_at + Duration::hours(1);

        let trace = trace(key.product, &[issue, second, first], day(1), day(1));
        let consumed = &trace.entries[2].consumed;
        assert_eq!(consumed, &vec![CostSlice { quantity: dec(5), unit_cost: dec(10) }]);
        assert_eq!(trace.closing.asset_value, dec(100));
    }
}
