use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::info;

use stockbook_accounting::{CounterAccounts, JournalEntry, inventory_lines, net_by_account};
use stockbook_core::{
    AccountId, BusinessId, JournalEntryId, OutboxAction, ReferenceId, ReferenceType,
};
use stockbook_inventory::{Document, ProductKey};

use super::WorkflowError;
use crate::catalog::Catalog;
use crate::store::StockTx;

/// Posts the accounting side of a processed document.
///
/// Runs inside the posting transaction, after the ledger rows for the
/// message have been written.
pub trait AccountingPublisher: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn post_journal(
        &self,
        tx: &mut dyn StockTx,
        business_id: BusinessId,
        effective_date: NaiveDate,
        reference_id: ReferenceId,
        reference_type: ReferenceType,
        new_state: Option<&Document>,
        old_state: Option<&Document>,
        action: OutboxAction,
    ) -> Result<Option<JournalEntryId>, WorkflowError>;
}

/// Posts nothing. For deployments where another system owns the journal.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAccountingPublisher;

impl AccountingPublisher for NoopAccountingPublisher {
    fn post_journal(
        &self,
        _tx: &mut dyn StockTx,
        _business_id: BusinessId,
        _effective_date: NaiveDate,
        _reference_id: ReferenceId,
        _reference_type: ReferenceType,
        _new_state: Option<&Document>,
        _old_state: Option<&Document>,
        _action: OutboxAction,
    ) -> Result<Option<JournalEntryId>, WorkflowError> {
        Ok(None)
    }
}

/// Keeps the inventory accounts of a reference equal to the FIFO value of
/// its valid ledger rows.
///
/// Each run values the reference's rows per inventory account, subtracts
/// what earlier entries already moved and journals the difference against
/// the reference type's counter account. A replay finds no difference and
/// posts nothing.
pub struct InventoryJournalPublisher {
    catalog: Arc<dyn Catalog>,
    accounts: CounterAccounts,
}

impl InventoryJournalPublisher {
    pub fn new(catalog: Arc<dyn Catalog>, accounts: CounterAccounts) -> Self {
        Self { catalog, accounts }
    }

    fn counter_accounts(&self) -> HashSet<AccountId> {
        [
            self.accounts.cost_of_goods_sold,
            self.accounts.goods_received_clearing,
            self.accounts.inventory_adjustment,
            self.accounts.opening_balance_equity,
        ]
        .into_iter()
        .collect()
    }
}

impl AccountingPublisher for InventoryJournalPublisher {
    fn post_journal(
        &self,
        tx: &mut dyn StockTx,
        business_id: BusinessId,
        effective_date: NaiveDate,
        reference_id: ReferenceId,
        reference_type: ReferenceType,
        new_state: Option<&Document>,
        old_state: Option<&Document>,
        action: OutboxAction,
    ) -> Result<Option<JournalEntryId>, WorkflowError> {
        let rows = tx.history_for_reference(reference_type, reference_id)?;

        let mut accounts: HashMap<ProductKey, Option<AccountId>> = HashMap::new();
        let mut deltas: BTreeMap<AccountId, Decimal> = BTreeMap::new();
        for row in rows.iter().filter(|r| r.is_valid()) {
            let account = match accounts.get(&row.key.product) {
                Some(account) => *account,
                None => {
                    let account = self
                        .catalog
                        .resolve_product(business_id, &row.key.product)?
                        .inventory_account_id;
                    accounts.insert(row.key.product, account);
                    account
                }
            };
            if let Some(account) = account {
                *deltas.entry(account).or_default() += row.value();
            }
        }

        let counters = self.counter_accounts();
        let prior = tx.journal_entries_for_reference(reference_type, reference_id)?;
        for (account, net) in net_by_account(&prior) {
            if !counters.contains(&account) {
                *deltas.entry(account).or_default() -= net;
            }
        }

        let lines = inventory_lines(&deltas, self.accounts.for_reference(reference_type));
        if lines.is_empty() {
            return Ok(None);
        }

        let line_count = new_state.or(old_state).map_or(0, |d| d.lines.len());
        let entry = JournalEntry {
            id: JournalEntryId::new(),
            business_id,
            reference_type,
            reference_id,
            action,
            effective_date,
            lines,
            description: Some(format!(
                "inventory {action} for {reference_type} {reference_id} ({line_count} lines)"
            )),
            posted_at: Utc::now(),
        };
        entry
            .validate()
            .map_err(|e| WorkflowError::Accounting(e.to_string()))?;
        tx.insert_journal_entry(&entry)?;

        info!(
            journal_entry_id = %entry.id,
            reference_type = %reference_type,
            reference_id = %reference_id,
            line_count = entry.lines.len(),
            "inventory journal posted"
        );
        Ok(Some(entry.id))
    }
}
