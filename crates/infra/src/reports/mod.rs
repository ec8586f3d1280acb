//! Stock report queries.
//!
//! Every report has a cache-backed form (summaries, daily balances) and,
//! where the shape allows, a ledger-backed twin computed from valid rows
//! only. The twins exist to cross-check the caches.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

use stockbook_core::{BusinessId, WarehouseId};
use stockbook_inventory::{
    ProductKey, StockBuckets, StockHistory, StockKey, ValuationTotals, ValuationTrace,
    buckets_from_ledger, trace,
};

use crate::store::{HistoryFilter, StockStore, StoreResult};

/// On-hand quantity of one stock key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnHandRow {
    pub key: StockKey,
    pub current_qty: Decimal,
}

/// Bucket totals of one product as of a date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventorySummaryRow {
    pub product: ProductKey,
    pub buckets: StockBuckets,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehouseInventoryRow {
    pub warehouse_id: WarehouseId,
    pub product: ProductKey,
    pub buckets: StockBuckets,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValuationRow {
    pub product: ProductKey,
    pub totals: ValuationTotals,
}

/// A key whose cached buckets disagree with its ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheDrift {
    pub key: StockKey,
    /// `None` when the ledger has rows but no summary exists.
    pub cached: Option<StockBuckets>,
    pub ledger: StockBuckets,
}

/// Read-only report queries over a stock store.
#[derive(Debug, Clone)]
pub struct InventoryReports<S: StockStore> {
    store: S,
}

impl<S: StockStore> InventoryReports<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Current on-hand per key, from the summaries.
    pub fn current_on_hand(
        &self,
        business_id: BusinessId,
        warehouse_id: Option<WarehouseId>,
    ) -> StoreResult<Vec<OnHandRow>> {
        let summaries = self
            .store
            .transact(business_id, |tx| tx.summaries(warehouse_id))?;
        let mut rows: Vec<OnHandRow> = summaries
            .into_iter()
            .map(|s| OnHandRow {
                key: s.key,
                current_qty: s.buckets.current_qty,
            })
            .collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(rows)
    }

    /// Current on-hand per key, summed directly from valid ledger rows.
    pub fn ledger_on_hand(
        &self,
        business_id: BusinessId,
        warehouse_id: Option<WarehouseId>,
    ) -> StoreResult<Vec<OnHandRow>> {
        let filter = HistoryFilter {
            warehouse_id,
            valid_only: true,
            ..Default::default()
        };
        let history = self.store.transact(business_id, |tx| tx.history(&filter))?;

        let mut totals: BTreeMap<StockKey, Decimal> = BTreeMap::new();
        for row in history {
            *totals.entry(row.key).or_default() += row.quantity;
        }
        Ok(totals
            .into_iter()
            .map(|(key, current_qty)| OnHandRow { key, current_qty })
            .collect())
    }

    /// Buckets per product as of the end of `as_of`, from the daily balances.
    pub fn inventory_summary(
        &self,
        business_id: BusinessId,
        as_of: NaiveDate,
        warehouse_id: Option<WarehouseId>,
    ) -> StoreResult<Vec<InventorySummaryRow>> {
        let balances = self
            .store
            .transact(business_id, |tx| tx.daily_balances_as_of(as_of, warehouse_id))?;

        let mut per_product: BTreeMap<ProductKey, StockBuckets> = BTreeMap::new();
        for balance in &balances {
            per_product
                .entry(balance.key.product)
                .or_default()
                .add(&balance.buckets);
        }
        Ok(into_summary_rows(per_product))
    }

    /// Same shape as [`Self::inventory_summary`], aggregated from the ledger.
    pub fn inventory_summary_from_ledger(
        &self,
        business_id: BusinessId,
        as_of: NaiveDate,
        warehouse_id: Option<WarehouseId>,
    ) -> StoreResult<Vec<InventorySummaryRow>> {
        let rows = self.valid_rows(business_id, as_of, warehouse_id)?;

        let mut per_product: BTreeMap<ProductKey, Vec<&StockHistory>> = BTreeMap::new();
        for row in &rows {
            per_product.entry(row.key.product).or_default().push(row);
        }
        Ok(into_summary_rows(
            per_product
                .into_iter()
                .map(|(product, rows)| (product, buckets_from_ledger(rows)))
                .collect(),
        ))
    }

    /// Buckets per warehouse and product as of the end of `as_of`.
    pub fn warehouse_inventory(
        &self,
        business_id: BusinessId,
        as_of: NaiveDate,
    ) -> StoreResult<Vec<WarehouseInventoryRow>> {
        let balances = self
            .store
            .transact(business_id, |tx| tx.daily_balances_as_of(as_of, None))?;

        let mut grouped: BTreeMap<(WarehouseId, ProductKey), StockBuckets> = BTreeMap::new();
        for balance in &balances {
            grouped
                .entry((balance.key.warehouse_id, balance.key.product))
                .or_default()
                .add(&balance.buckets);
        }
        Ok(grouped
            .into_iter()
            .map(|((warehouse_id, product), buckets)| WarehouseInventoryRow {
                warehouse_id,
                product,
                buckets,
            })
            .collect())
    }

    /// On-hand and FIFO asset value per product as of the end of `as_of`.
    ///
    /// Transfer legs carry the cost of the layers they moved, so a transfer
    /// changes neither total when no warehouse filter is applied.
    pub fn valuation(
        &self,
        business_id: BusinessId,
        as_of: NaiveDate,
        warehouse_id: Option<WarehouseId>,
    ) -> StoreResult<Vec<ValuationRow>> {
        let rows = self.valid_rows(business_id, as_of, warehouse_id)?;

        let mut per_product: BTreeMap<ProductKey, ValuationTotals> = BTreeMap::new();
        for row in &rows {
            per_product.entry(row.key.product).or_default().add_row(row);
        }
        Ok(per_product
            .into_iter()
            .map(|(product, totals)| ValuationRow { product, totals })
            .collect())
    }

    /// FIFO layer trace of one product between `from` and `to`.
    pub fn valuation_detail(
        &self,
        business_id: BusinessId,
        from: NaiveDate,
        to: NaiveDate,
        product: ProductKey,
        warehouse_id: Option<WarehouseId>,
    ) -> StoreResult<ValuationTrace> {
        let filter = HistoryFilter {
            warehouse_id,
            product: Some(product),
            until: Some(to),
            valid_only: true,
            ..Default::default()
        };
        let rows = self.store.transact(business_id, |tx| tx.history(&filter))?;
        Ok(trace(product, &rows, from, to))
    }

    /// Keys whose summary does not match a rebuild from the ledger.
    ///
    /// The committed bucket has no ledger rows and is not compared.
    pub fn reconcile(&self, business_id: BusinessId) -> StoreResult<Vec<CacheDrift>> {
        let filter = HistoryFilter {
            valid_only: true,
            ..Default::default()
        };
        let (summaries, history) = self.store.transact(business_id, |tx| {
            Ok::<_, crate::store::StoreError>((tx.summaries(None)?, tx.history(&filter)?))
        })?;

        let mut ledger: BTreeMap<StockKey, StockBuckets> = BTreeMap::new();
        for row in &history {
            ledger.entry(row.key.clone()).or_default().record(row);
        }

        let mut drift = Vec::new();
        for summary in summaries {
            let rebuilt = ledger.remove(&summary.key).unwrap_or_default();
            if !summary.buckets.same_movements(&rebuilt) {
                drift.push(CacheDrift {
                    key: summary.key,
                    cached: Some(summary.buckets),
                    ledger: rebuilt,
                });
            }
        }
        for (key, rebuilt) in ledger {
            drift.push(CacheDrift {
                key,
                cached: None,
                ledger: rebuilt,
            });
        }

        if drift.is_empty() {
            info!(business_id = %business_id, "stock cache matches ledger");
        } else {
            warn!(business_id = %business_id, drifted_keys = drift.len(), "stock cache drift detected");
        }
        Ok(drift)
    }

    fn valid_rows(
        &self,
        business_id: BusinessId,
        as_of: NaiveDate,
        warehouse_id: Option<WarehouseId>,
    ) -> StoreResult<Vec<StockHistory>> {
        let filter = HistoryFilter {
            warehouse_id,
            until: Some(as_of),
            valid_only: true,
            ..Default::default()
        };
        self.store.transact(business_id, |tx| tx.history(&filter))
    }
}

fn into_summary_rows(per_product: BTreeMap<ProductKey, StockBuckets>) -> Vec<InventorySummaryRow> {
    per_product
        .into_iter()
        .map(|(product, buckets)| InventorySummaryRow { product, buckets })
        .collect()
}
