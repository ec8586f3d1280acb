//! As-of availability checks for ledger changes.
//!
//! A change dated T is checked against end-of-day balances from T onwards,
//! not against today's totals: stock that only arrives after T cannot cover
//! an issue dated T, and a later issue that already consumed stock still
//! needs it.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

use stockbook_core::StockHistoryId;

use crate::history::StockHistory;
use crate::key::StockKey;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("insufficient stock for {key} on {date}: {available} available, {required} required")]
pub struct StockShortfall {
    pub key: StockKey,
    pub date: NaiveDate,
    pub available: Decimal,
    pub required: Decimal,
}

/// Check that removing `removed` rows and adding `added` (date, signed qty)
/// movements keeps every end-of-day balance of `key` at or above zero from
/// the earliest changed date onwards.
///
/// A balance that was already negative only fails if the change makes it
/// worse.
pub fn check_availability(
    key: &StockKey,
    rows: &[StockHistory],
    removed: &HashSet<StockHistoryId>,
    added: &[(NaiveDate, Decimal)],
) -> Result<(), StockShortfall> {
    // date -> (old delta, new delta)
    let mut days: BTreeMap<NaiveDate, (Decimal, Decimal)> = BTreeMap::new();
    let mut earliest: Option<NaiveDate> = None;

    for row in rows.iter().filter(|r| r.is_valid() && r.key == *key) {
        let day = days.entry(row.stock_date).or_default();
        day.0 += row.quantity;
        if removed.contains(&row.id) {
            earliest = Some(earliest.map_or(row.stock_date, |e| e.min(row.stock_date)));
        } else {
            day.1 += row.quantity;
        }
    }
    for (date, qty) in added {
        days.entry(*date).or_default().1 += *qty;
        earliest = Some(earliest.map_or(*date, |e| e.min(*date)));
    }

    let Some(earliest) = earliest else {
        return Ok(());
    };

    let mut old_balance = Decimal::ZERO;
    let mut new_balance = Decimal::ZERO;
    for (date, (old_delta, new_delta)) in days {
        old_balance += old_delta;
        new_balance += new_delta;
        if date >= earliest && new_balance < Decimal::ZERO && new_balance < old_balance {
            return Err(StockShortfall {
                key: key.clone(),
                date,
                available: old_balance.max(Decimal::ZERO),
                required: old_balance.max(Decimal::ZERO) - new_balance,
            });
        }
    }
    Ok(())
}
