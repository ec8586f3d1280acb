use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use stockbook_core::{
    AccountId, BusinessId, JournalEntryId, OutboxAction, ReferenceId, ReferenceType,
};

/// One side of a journal entry (immutable).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalLine {
    pub account_id: AccountId,
    /// Always positive; the side is carried by `is_debit`.
    pub amount: Decimal,
    /// true = debit, false = credit.
    pub is_debit: bool,
}

impl JournalLine {
    pub fn debit(account_id: AccountId, amount: Decimal) -> Self {
        Self {
            account_id,
            amount,
            is_debit: true,
        }
    }

    pub fn credit(account_id: AccountId, amount: Decimal) -> Self {
        Self {
            account_id,
            amount,
            is_debit: false,
        }
    }

    /// Debit-positive signed amount.
    pub fn signed_amount(&self) -> Decimal {
        if self.is_debit { self.amount } else { -self.amount }
    }
}

/// A journal entry recorded for one workflow-processor run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: JournalEntryId,
    pub business_id: BusinessId,
    pub reference_type: ReferenceType,
    pub reference_id: ReferenceId,
    pub action: OutboxAction,
    pub effective_date: NaiveDate,
    pub lines: Vec<JournalLine>,
    pub description: Option<String>,
    pub posted_at: DateTime<Utc>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JournalError {
    #[error("journal entry must have lines")]
    Empty,

    #[error("amount for account {0} must be positive")]
    NonPositiveAmount(AccountId),

    #[error("journal entry is unbalanced: debits {debits}, credits {credits}")]
    Unbalanced { debits: Decimal, credits: Decimal },
}

impl JournalEntry {
    /// Double-entry checks: non-empty, positive amounts, debits == credits.
    pub fn validate(&self) -> Result<(), JournalError> {
        if self.lines.is_empty() {
            return Err(JournalError::Empty);
        }

        let mut debits = Decimal::ZERO;
        let mut credits = Decimal::ZERO;
        for line in &self.lines {
            if line.amount <= Decimal::ZERO {
                return Err(JournalError::NonPositiveAmount(line.account_id));
            }
            if line.is_debit {
                debits += line.amount;
            } else {
                credits += line.amount;
            }
        }

        if debits != credits {
            return Err(JournalError::Unbalanced { debits, credits });
        }
        Ok(())
    }
}

/// Debit-positive net per account over `entries`.
pub fn net_by_account<'a>(
    entries: impl IntoIterator<Item = &'a JournalEntry>,
) -> BTreeMap<AccountId, Decimal> {
    let mut net: BTreeMap<AccountId, Decimal> = BTreeMap::new();
    for line in entries.into_iter().flat_map(|e| e.lines.iter()) {
        *net.entry(line.account_id).or_default() += line.signed_amount();
    }
    net
}

/// Lines moving inventory accounts by `deltas` (debit-positive) against
/// `counter`. Empty when every delta is zero.
pub fn inventory_lines(deltas: &BTreeMap<AccountId, Decimal>, counter: AccountId) -> Vec<JournalLine> {
    let mut lines = Vec::new();
    let mut offset = Decimal::ZERO;

    for (account_id, delta) in deltas {
        if delta.is_zero() {
            continue;
        }
        offset -= *delta;
        lines.push(if *delta > Decimal::ZERO {
            JournalLine::debit(*account_id, *delta)
        } else {
            JournalLine::credit(*account_id, -*delta)
        });
    }

    if offset > Decimal::ZERO {
        lines.push(JournalLine::debit(counter, offset));
    } else if offset < Decimal::ZERO {
        lines.push(JournalLine::credit(counter, -offset));
    }
    lines
}

/// Counter accounts used when inventory value moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterAccounts {
    /// Invoices and credit notes.
    pub cost_of_goods_sold: AccountId,
    /// Bills and supplier credits.
    pub goods_received_clearing: AccountId,
    /// Adjustments, and transfers between differently mapped accounts.
    pub inventory_adjustment: AccountId,
    pub opening_balance_equity: AccountId,
}

impl CounterAccounts {
    pub fn for_reference(&self, reference_type: ReferenceType) -> AccountId {
        match reference_type {
            ReferenceType::Invoice | ReferenceType::CreditNote => self.cost_of_goods_sold,
            ReferenceType::Bill | ReferenceType::SupplierCredit => self.goods_received_clearing,
            ReferenceType::InventoryAdjustment | ReferenceType::TransferOrder => {
                self.inventory_adjustment
            }
            ReferenceType::OpeningStock => self.opening_balance_equity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(lines: Vec<JournalLine>) -> JournalEntry {
        JournalEntry {
            id: JournalEntryId::new(),
            business_id: BusinessId::new(),
            reference_type: ReferenceType::Bill,
            reference_id: ReferenceId::new(),
            action: OutboxAction::Create,
            effective_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            lines,
            description: None,
            posted_at: Utc::now(),
        }
    }

    #[test]
    fn unbalanced_entry_is_rejected() {
        let a = AccountId::new();
        let b = AccountId::new();
        let e = entry(vec![
            JournalLine::debit(a, Decimal::from(10)),
            JournalLine::credit(b, Decimal::from(9)),
        ]);
        assert!(matches!(e.validate(), Err(JournalError::Unbalanced { .. })));
    }

    #[test]
    fn empty_entry_is_rejected() {
        assert_eq!(entry(vec![]).validate(), Err(JournalError::Empty));
    }

    #[test]
    fn inventory_increase_is_credited_to_counter_account() {
        let inventory = AccountId::new();
        let clearing = AccountId::new();
        let deltas: BTreeMap<_, _> = [(inventory, Decimal::from(500))].into_iter().collect();

        let lines = inventory_lines(&deltas, clearing);
        assert_eq!(
            lines,
            vec![
                JournalLine::debit(inventory, Decimal::from(500)),
                JournalLine::credit(clearing, Decimal::from(500)),
            ]
        );
    }

    #[test]
    fn offsetting_deltas_need_no_counter_line() {
        let a = AccountId::new();
        let b = AccountId::new();
        let deltas: BTreeMap<_, _> =
            [(a, Decimal::from(-70)), (b, Decimal::from(70))].into_iter().collect();
        let lines = inventory_lines(&deltas, AccountId::new());
        assert_eq!(lines.len(), 2);
        assert!(entry(lines).validate().is_ok());
    }

    #[test]
    fn net_by_account_is_debit_positive() {
        let a = AccountId::new();
        let b = AccountId::new();
        let e = entry(vec![
            JournalLine::debit(a, Decimal::from(3)),
            JournalLine::credit(b, Decimal::from(3)),
        ]);
        let net = net_by_account([&e]);
        assert_eq!(net[&a], Decimal::from(3));
        assert_eq!(net[&b], Decimal::from(-3));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: for any set of inventory value deltas, the generated
        /// lines balance and move each inventory account by its delta.
        #[test]
        fn generated_lines_always_balance(
            cents in prop::collection::vec(-1_000_000i64..1_000_000i64, 1..8)
        ) {
            let deltas: BTreeMap<AccountId, Decimal> = cents
                .iter()
                .map(|c| (AccountId::new(), Decimal::new(*c, 2)))
                .collect();
            let counter = AccountId::new();
            let lines = inventory_lines(&deltas, counter);

            let total: Decimal = lines.iter().map(JournalLine::signed_amount).sum();
            prop_assert_eq!(total, Decimal::ZERO);

            let e = entry(lines);
            if !e.lines.is_empty() {
                prop_assert!(e.validate().is_ok());
            }
            let net = net_by_account([&e]);
            for (account, delta) in &deltas {
                prop_assert_eq!(net.get(account).copied().unwrap_or_default(), *delta);
            }
        }
    }
}
