//! Posting planner: turns "what a document should have posted" into the
//! ledger rows still missing.
//!
//! Planning is convergent. The target lines are diffed per detail id
//! against the still-valid rows already posted under the reference, so a
//! replayed create, update or delete plans nothing.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use thiserror::Error;

use stockbook_core::{DetailId, ReferenceId, ReferenceType, StockHistoryId};

use crate::availability::{StockShortfall, check_availability};
use crate::document::TargetLine;
use crate::fifo::{CostLayer, CostSlice, FifoBook, LayerOrigin};
use crate::history::{MovementFlags, NewMovement, StockHistory, sort_chronologically};
use crate::key::StockKey;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error(transparent)]
    InsufficientStock(#[from] StockShortfall),

    #[error("posted rows of {reference_id} are inconsistent: {reason}")]
    Inconsistent {
        reference_id: ReferenceId,
        reason: String,
    },
}

/// Rows to reverse and movements to append, in that order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostingPlan {
    pub reversals: Vec<StockHistory>,
    pub movements: Vec<NewMovement>,
}

impl PostingPlan {
    pub fn is_empty(&self) -> bool {
        self.reversals.is_empty() && self.movements.is_empty()
    }

    /// Keys the plan writes to, in lock order.
    pub fn keys(&self) -> BTreeSet<StockKey> {
        self.reversals
            .iter()
            .map(|r| r.key.clone())
            .chain(self.movements.iter().map(|m| m.key.clone()))
            .collect()
    }
}

/// What a reference should look like after processing.
#[derive(Debug, Clone, Copy)]
pub struct PlanRequest<'a> {
    pub reference_type: ReferenceType,
    pub reference_id: ReferenceId,
    /// Effective date of the target document.
    pub date: NaiveDate,
    /// Empty when nothing should remain posted (delete, draft, void).
    pub targets: &'a [TargetLine],
    /// Every row posted under the reference so far, valid or not.
    pub posted: &'a [StockHistory],
}

#[derive(Debug, Default)]
struct PostedDetail<'a> {
    primary: Vec<&'a StockHistory>,
    mirror: Vec<&'a StockHistory>,
}

impl PostedDetail<'_> {
    fn rows(&self) -> impl Iterator<Item = &StockHistory> {
        self.primary.iter().chain(self.mirror.iter()).copied()
    }

    fn quantity(&self) -> Decimal {
        let sum: Decimal = self.primary.iter().map(|r| r.quantity).sum();
        match self.primary.first() {
            Some(r) if r.flags.is_outgoing => -sum,
            _ => sum,
        }
    }

    fn matches(&self, target: &TargetLine, date: NaiveDate) -> bool {
        let Some(first) = self.primary.first() else {
            return false;
        };
        let primary_same = first.key == target.primary.key
            && first.flags == target.primary.flags
            && first.stock_date == date
            && target
                .primary
                .unit_cost
                .is_none_or(|cost| self.primary.iter().all(|r| r.base_unit_value == cost));
        let mirror_same = match (&target.mirror, self.mirror.first()) {
            (Some(leg), Some(row)) => row.key == leg.key && row.stock_date == date,
            (None, None) => true,
            _ => false,
        };
        primary_same && mirror_same
    }
}

enum Change<'a, 'b> {
    Delta(&'b TargetLine, &'b PostedDetail<'a>),
    Fresh(&'b TargetLine),
}

/// Keys whose ledgers [`plan`] needs.
pub fn affected_keys(targets: &[TargetLine], posted: &[StockHistory]) -> BTreeSet<StockKey> {
    let mut keys: BTreeSet<StockKey> = posted
        .iter()
        .filter(|r| r.is_valid())
        .map(|r| r.key.clone())
        .collect();
    for target in targets {
        keys.insert(target.primary.key.clone());
        if let Some(mirror) = &target.mirror {
            keys.insert(mirror.key.clone());
        }
    }
    keys
}

/// Plan the rows that bring the reference to `request.targets`.
///
/// `ledgers` must hold every row of each key in [`affected_keys`].
pub fn plan(
    request: &PlanRequest<'_>,
    ledgers: &BTreeMap<StockKey, Vec<StockHistory>>,
) -> Result<PostingPlan, PlanError> {
    let mut posted: Vec<StockHistory> =
        request.posted.iter().filter(|r| r.is_valid()).cloned().collect();
    sort_chronologically(&mut posted);

    let mut by_detail: BTreeMap<DetailId, PostedDetail<'_>> = BTreeMap::new();
    for row in &posted {
        let detail = by_detail.entry(row.reference_detail_id).or_default();
        if row.flags.is_transfer_in {
            detail.mirror.push(row);
        } else {
            detail.primary.push(row);
        }
    }

    let target_ids: HashSet<DetailId> = request.targets.iter().map(|t| t.detail_id).collect();
    let mut reversals: Vec<&StockHistory> = by_detail
        .iter()
        .filter(|(id, _)| !target_ids.contains(id))
        .flat_map(|(_, d)| d.rows())
        .collect();

    let mut changes = Vec::with_capacity(request.targets.len());
    for target in request.targets {
        match by_detail.get(&target.detail_id) {
            Some(old) if old.matches(target, request.date) => {
                changes.push(Change::Delta(target, old));
            }
            Some(old) => {
                reversals.extend(old.rows());
                changes.push(Change::Fresh(target));
            }
            None => changes.push(Change::Fresh(target)),
        }
    }

    let reversed: HashSet<StockHistoryId> = reversals.iter().map(|r| r.id).collect();
    let mut planner = Planner {
        request,
        ledgers,
        reversed: &reversed,
        books: BTreeMap::new(),
        movements: Vec::new(),
    };
    for change in changes {
        planner.apply(change)?;
    }
    let movements = planner.movements;

    let mut reversals: Vec<StockHistory> = reversals.into_iter().cloned().collect();
    sort_chronologically(&mut reversals);
    let plan = PostingPlan {
        reversals,
        movements,
    };
    check_plan_availability(&plan, &reversed, ledgers)?;
    Ok(plan)
}

struct Planner<'r, 'l> {
    request: &'r PlanRequest<'r>,
    ledgers: &'l BTreeMap<StockKey, Vec<StockHistory>>,
    reversed: &'r HashSet<StockHistoryId>,
    books: BTreeMap<StockKey, FifoBook>,
    movements: Vec<NewMovement>,
}

impl Planner<'_, '_> {
    fn book(&mut self, key: &StockKey) -> &mut FifoBook {
        let date = self.request.date;
        let ledgers = self.ledgers;
        let reversed = self.reversed;
        self.books.entry(key.clone()).or_insert_with(|| {
            let mut rows: Vec<StockHistory> = ledgers
                .get(key)
                .map(|rows| {
                    rows.iter()
                        .filter(|r| r.is_valid() && !reversed.contains(&r.id) && r.stock_date <= date)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            sort_chronologically(&mut rows);
            FifoBook::from_rows(&rows)
        })
    }

    fn push(&mut self, key: &StockKey, detail_id: DetailId, quantity: Decimal, unit_cost: Decimal, flags: MovementFlags) {
        self.movements.push(NewMovement {
            key: key.clone(),
            stock_date: self.request.date,
            quantity,
            unit_cost,
            reference_type: self.request.reference_type,
            reference_id: self.request.reference_id,
            detail_id,
            flags,
            reverses: None,
        });
    }

    fn layer(&self, origin: LayerOrigin, slice: &CostSlice) -> CostLayer {
        CostLayer {
            date: self.request.date,
            quantity: slice.quantity,
            unit_cost: slice.unit_cost,
            origin,
        }
    }

    fn apply(&mut self, change: Change<'_, '_>) -> Result<(), PlanError> {
        let (target, old_rows, old_qty) = match change {
            Change::Delta(target, old) => (target, old.primary.as_slice(), old.quantity()),
            Change::Fresh(target) => (target, &[][..], Decimal::ZERO),
        };
        let delta = target.primary.quantity - old_qty;
        if delta.is_zero() {
            return Ok(());
        }

        let origin = LayerOrigin {
            reference_id: self.request.reference_id,
            detail_id: target.detail_id,
        };
        let primary = &target.primary;

        let slices = match primary.unit_cost {
            Some(cost) => {
                self.push(&primary.key, target.detail_id, delta, cost, primary.flags);
                let layer = self.layer(origin, &CostSlice { quantity: delta, unit_cost: cost });
                let book = self.book(&primary.key);
                if delta > Decimal::ZERO {
                    book.receive(layer);
                } else {
                    book.withdraw(origin, -delta);
                }
                Vec::new()
            }
            None if delta > Decimal::ZERO => {
                let date = self.request.date;
                let slices = self.book(&primary.key).consume(delta).map_err(|e| StockShortfall {
                    key: primary.key.clone(),
                    date,
                    available: e.available.max(Decimal::ZERO),
                    required: e.requested,
                })?;
                for slice in &slices {
                    self.push(&primary.key, target.detail_id, -slice.quantity, slice.unit_cost, primary.flags);
                }
                slices
            }
            None => {
                let slices = self.returned_slices(old_rows, -delta)?;
                for slice in &slices {
                    self.push(&primary.key, target.detail_id, slice.quantity, slice.unit_cost, primary.flags);
                    let layer = self.layer(origin, slice);
                    self.book(&primary.key).receive(layer);
                }
                slices
            }
        };

        if let Some(mirror) = &target.mirror {
            for slice in &slices {
                if delta > Decimal::ZERO {
                    self.push(&mirror.key, target.detail_id, slice.quantity, slice.unit_cost, mirror.flags);
                    let layer = self.layer(origin, slice);
                    self.book(&mirror.key).receive(layer);
                } else {
                    self.push(&mirror.key, target.detail_id, -slice.quantity, slice.unit_cost, mirror.flags);
                    self.book(&mirror.key).withdraw(origin, slice.quantity);
                }
            }
        }
        Ok(())
    }

    /// Slices to hand back when an issue shrinks: the most recently consumed
    /// slices of that line, at their original cost.
    fn returned_slices(&self, rows: &[&StockHistory], quantity: Decimal) -> Result<Vec<CostSlice>, PlanError> {
        let mut consumed: Vec<CostSlice> = Vec::new();
        for row in rows {
            if row.quantity < Decimal::ZERO {
                consumed.push(CostSlice {
                    quantity: -row.quantity,
                    unit_cost: row.base_unit_value,
                });
            } else {
                pop_back(&mut consumed, row.quantity);
            }
        }

        let mut remaining = quantity;
        let mut returned: Vec<CostSlice> = Vec::new();
        while remaining > Decimal::ZERO {
            let Some(last) = consumed.last_mut() else {
                return Err(PlanError::Inconsistent {
                    reference_id: self.request.reference_id,
                    reason: format!("cannot return {remaining} more than was issued"),
                });
            };
            let taken = remaining.min(last.quantity);
            let unit_cost = last.unit_cost;
            last.quantity -= taken;
            remaining -= taken;
            if last.quantity.is_zero() {
                consumed.pop();
            }
            match returned.last_mut() {
                Some(prev) if prev.unit_cost == unit_cost => prev.quantity += taken,
                _ => returned.push(CostSlice {
                    quantity: taken,
                    unit_cost,
                }),
            }
        }
        Ok(returned)
    }
}

fn pop_back(stack: &mut Vec<CostSlice>, quantity: Decimal) {
    let mut remaining = quantity;
    while remaining > Decimal::ZERO {
        let Some(last) = stack.last_mut() else {
            return;
        };
        let taken = remaining.min(last.quantity);
        last.quantity -= taken;
        remaining -= taken;
        if last.quantity.is_zero() {
            stack.pop();
        }
    }
}

fn check_plan_availability(
    plan: &PostingPlan,
    reversed: &HashSet<StockHistoryId>,
    ledgers: &BTreeMap<StockKey, Vec<StockHistory>>,
) -> Result<(), StockShortfall> {
    let mut added: BTreeMap<&StockKey, Vec<(NaiveDate, Decimal)>> = BTreeMap::new();
    for movement in &plan.movements {
        added
            .entry(&movement.key)
            .or_default()
            .push((movement.stock_date, movement.quantity));
    }

    for key in plan.keys() {
        let rows = ledgers.get(&key).map(Vec::as_slice).unwrap_or(&[]);
        let changes = added.get(&key).map(Vec::as_slice).unwrap_or(&[]);
        check_availability(&key, rows, reversed, changes)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stockbook_core::{BusinessId, ProductId, WarehouseId};

    use crate::document::Leg;
    use crate::key::ProductKey;

    fn dec(v: i64) -> Decimal {
        Decimal::from(v)
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 2, d).unwrap()
    }

    struct Ledger {
        business: BusinessId,
        product: ProductKey,
        rows: Vec<StockHistory>,
    }

    impl Ledger {
        fn new() -> Self {
            Self {
                business: BusinessId::new(),
                product: ProductKey::single(ProductId::new()),
                rows: Vec::new(),
            }
        }

        fn key(&self, warehouse: WarehouseId) -> StockKey {
            StockKey::untracked(self.business, warehouse, self.product)
        }

        /// Apply a plan the way the ledger writer would.
        fn commit(&mut self, plan: PostingPlan) {
            for original in plan.reversals {
                let reversal = NewMovement::reversal_of(&original);
                let id = self.append(reversal);
                if let Some(row) = self.rows.iter_mut().find(|r| r.id == original.id) {
                    row.reversed_by_stock_history_id = Some(id);
                }
            }
            for movement in plan.movements {
                self.append(movement);
            }
        }

        fn append(&mut self, movement: NewMovement) -> StockHistoryId {
            let seq = self.rows.iter().filter(|r| r.key == movement.key).count() as i64 + 1;
            let id = StockHistoryId::new();
            self.rows.push(movement.into_row(id, seq, Utc::now()));
            id
        }

        fn ledgers(&self) -> BTreeMap<StockKey, Vec<StockHistory>> {
            let mut map: BTreeMap<StockKey, Vec<StockHistory>> = BTreeMap::new();
            for row in &self.rows {
                map.entry(row.key.clone()).or_default().push(row.clone());
            }
            map
        }

        fn posted(&self, reference_id: ReferenceId) -> Vec<StockHistory> {
            self.rows.iter().filter(|r| r.reference_id == reference_id).cloned().collect()
        }

        fn on_hand(&self, key: &StockKey) -> Decimal {
            self.rows.iter().filter(|r| r.is_valid() && r.key == *key).map(|r| r.quantity).sum()
        }

        fn run(
            &mut self,
            reference_type: ReferenceType,
            reference_id: ReferenceId,
            date: NaiveDate,
            targets: &[TargetLine],
        ) -> Result<PostingPlan, PlanError> {
            let posted = self.posted(reference_id);
            let plan = plan(
                &PlanRequest {
                    reference_type,
                    reference_id,
                    date,
                    targets,
                    posted: &posted,
                },
                &self.ledgers(),
            )?;
            self.commit(plan.clone());
            Ok(plan)
        }
    }

    fn receipt(detail_id: DetailId, key: &StockKey, qty: i64, cost: i64) -> TargetLine {
        TargetLine {
            detail_id,
            primary: Leg {
                key: key.clone(),
                flags: MovementFlags::RECEIPT,
                quantity: dec(qty),
                unit_cost: Some(dec(cost)),
            },
            mirror: None,
        }
    }

    fn issue(detail_id: DetailId, key: &StockKey, qty: i64) -> TargetLine {
        TargetLine {
            detail_id,
            primary: Leg {
                key: key.clone(),
                flags: MovementFlags::ISSUE,
                quantity: dec(qty),
                unit_cost: None,
            },
            mirror: None,
        }
    }

    fn transfer(detail_id: DetailId, from: &StockKey, to: &StockKey, qty: i64) -> TargetLine {
        let mut line = issue(detail_id, from, qty);
        line.mirror = Some(Leg {
            key: to.clone(),
            flags: MovementFlags::TRANSFER_IN,
            quantity: dec(qty),
            unit_cost: None,
        });
        line
    }

    #[test]
    fn replaying_the_same_target_plans_nothing() {
        let mut ledger = Ledger::new();
        let w1 = ledger.key(WarehouseId::new());
        let bill = ReferenceId::new();
        let line = receipt(DetailId::new(), &w1, 10, 5);

        let first = ledger.run(ReferenceType::Bill, bill, day(1), &[line.clone()]).unwrap();
        assert_eq!(first.movements.len(), 1);

        let second = ledger.run(ReferenceType::Bill, bill, day(1), &[line]).unwrap();
        assert!(second.is_empty());
        assert_eq!(ledger.on_hand(&w1), dec(10));
    }

    #[test]
    fn issue_spanning_layers_posts_one_row_per_layer() {
        let mut ledger = Ledger::new();
        let w1 = ledger.key(WarehouseId::new());
        ledger.run(ReferenceType::Bill, ReferenceId::new(), day(1), &[receipt(DetailId::new(), &w1, 10, 50)]).unwrap();
        ledger.run(ReferenceType::Bill, ReferenceId::new(), day(2), &[receipt(DetailId::new(), &w1, 10, 60)]).unwrap();

        let plan = ledger
            .run(ReferenceType::Invoice, ReferenceId::new(), day(3), &[issue(DetailId::new(), &w1, 15)])
            .unwrap();

        let costs: Vec<(Decimal, Decimal)> =
            plan.movements.iter().map(|m| (m.quantity, m.unit_cost)).collect();
        assert_eq!(costs, vec![(dec(-10), dec(50)), (dec(-5), dec(60))]);
    }

    #[test]
    fn update_posts_only_the_delta() {
        let mut ledger = Ledger::new();
        let w1 = ledger.key(WarehouseId::new());
        ledger.run(ReferenceType::OpeningStock, ReferenceId::new(), day(1), &[receipt(DetailId::new(), &w1, 100, 50)]).unwrap();

        let invoice = ReferenceId::new();
        let detail = DetailId::new();
        ledger.run(ReferenceType::Invoice, invoice, day(2), &[issue(detail, &w1, 10)]).unwrap();

        let grow = ledger.run(ReferenceType::Invoice, invoice, day(2), &[issue(detail, &w1, 14)]).unwrap();
        assert!(grow.reversals.is_empty());
        assert_eq!(grow.movements.len(), 1);
        assert_eq!(grow.movements[0].quantity, dec(-4));

        let shrink = ledger.run(ReferenceType::Invoice, invoice, day(2), &[issue(detail, &w1, 6)]).unwrap();
        assert_eq!(shrink.movements[0].quantity, dec(8));
        assert!(shrink.movements[0].flags.is_outgoing);
        assert_eq!(ledger.on_hand(&w1), dec(94));
    }

    #[test]
    fn delete_reverses_everything_posted() {
        let mut ledger = Ledger::new();
        let w1 = ledger.key(WarehouseId::new());
        let bill = ReferenceId::new();
        ledger.run(ReferenceType::Bill, bill, day(1), &[receipt(DetailId::new(), &w1, 10, 5), receipt(DetailId::new(), &w1, 3, 7)]).unwrap();

        let plan = ledger.run(ReferenceType::Bill, bill, day(1), &[]).unwrap();
        assert_eq!(plan.reversals.len(), 2);
        assert!(plan.movements.is_empty());
        assert_eq!(ledger.on_hand(&w1), Decimal::ZERO);

        let again = ledger.run(ReferenceType::Bill, bill, day(1), &[]).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn changing_the_product_of_a_line_reposts_it() {
        let mut ledger = Ledger::new();
        let w = WarehouseId::new();
        let a = ledger.key(w);
        let b = StockKey::untracked(ledger.business, w, ProductKey::single(ProductId::new()));
        let bill = ReferenceId::new();
        let detail = DetailId::new();

        ledger.run(ReferenceType::Bill, bill, day(1), &[receipt(detail, &a, 4, 5)]).unwrap();
        let plan = ledger.run(ReferenceType::Bill, bill, day(1), &[receipt(detail, &b, 4, 5)]).unwrap();

        assert_eq!(plan.reversals.len(), 1);
        assert_eq!(plan.movements.len(), 1);
        assert_eq!(ledger.on_hand(&a), Decimal::ZERO);
        assert_eq!(ledger.on_hand(&b), dec(4));
    }

    #[test]
    fn transfer_conserves_quantity_and_cost() {
        let mut ledger = Ledger::new();
        let w1 = ledger.key(WarehouseId::new());
        let w2 = ledger.key(WarehouseId::new());
        ledger.run(ReferenceType::OpeningStock, ReferenceId::new(), day(1), &[receipt(DetailId::new(), &w1, 100, 50)]).unwrap();

        let order = ReferenceId::new();
        let detail = DetailId::new();
        ledger.run(ReferenceType::TransferOrder, order, day(2), &[transfer(detail, &w1, &w2, 10)]).unwrap();
        ledger.run(ReferenceType::TransferOrder, order, day(2), &[transfer(detail, &w1, &w2, 4)]).unwrap();

        let rows = ledger.posted(order);
        let net: Decimal = rows.iter().filter(|r| r.is_valid()).map(|r| r.quantity).sum();
        let value: Decimal = rows.iter().filter(|r| r.is_valid()).map(StockHistory::value).sum();
        assert_eq!(net, Decimal::ZERO);
        assert_eq!(value, Decimal::ZERO);
        assert_eq!(ledger.on_hand(&w1), dec(96));
        assert_eq!(ledger.on_hand(&w2), dec(4));
    }

    #[test]
    fn increasing_a_back_dated_issue_checks_stock_as_of_its_date() {
        let mut ledger = Ledger::new();
        let w1 = ledger.key(WarehouseId::new());
        ledger.run(ReferenceType::Bill, ReferenceId::new(), day(1), &[receipt(DetailId::new(), &w1, 10, 5)]).unwrap();

        let invoice = ReferenceId::new();
        let detail = DetailId::new();
        ledger.run(ReferenceType::Invoice, invoice, day(5), &[issue(detail, &w1, 5)]).unwrap();
        // Replenished later.
        ledger.run(ReferenceType::Bill, ReferenceId::new(), day(20), &[receipt(DetailId::new(), &w1, 100, 5)]).unwrap();

        let err = ledger
            .run(ReferenceType::Invoice, invoice, day(5), &[issue(detail, &w1, 12)])
            .unwrap_err();
        match err {
            PlanError::InsufficientStock(s) => {
                assert_eq!(s.date, day(5));
                assert_eq!(s.available, dec(5));
                assert_eq!(s.required, dec(7));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn deleting_a_consumed_receipt_is_rejected() {
        let mut ledger = Ledger::new();
        let w1 = ledger.key(WarehouseId::new());
        let bill = ReferenceId::new();
        ledger.run(ReferenceType::Bill, bill, day(1), &[receipt(DetailId::new(), &w1, 10, 5)]).unwrap();
        ledger.run(ReferenceType::Invoice, ReferenceId::new(), day(2), &[issue(DetailId::new(), &w1, 8)]).unwrap();

        let err = ledger.run(ReferenceType::Bill, bill, day(1), &[]).unwrap_err();
        assert!(matches!(err, PlanError::InsufficientStock(_)));
    }
}
