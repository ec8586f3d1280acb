use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use stockbook_core::{OutboxAction, ReferenceId, ReferenceType};
use stockbook_inventory::plan::plan as plan_postings;
use stockbook_inventory::{
    Document, DocumentError, DocumentSnapshot, PlanRequest, PostingPlan, TargetLine, affected_keys,
};
use stockbook_outbox::OutboxMessage;

use super::accounting::AccountingPublisher;
use super::{ProcessOutcome, WorkflowError};
use crate::catalog::Catalog;
use crate::ledger::{ConcurrencyGuard, LedgerWriter, StockCacheUpdater};
use crate::store::StockTx;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyLocks {
    Acquire,
    Skip,
}

/// Shared posting pipeline behind every workflow processor.
pub struct StockPostingEngine {
    catalog: Arc<dyn Catalog>,
    guard: ConcurrencyGuard,
    writer: LedgerWriter,
    accounting: Arc<dyn AccountingPublisher>,
}

impl fmt::Debug for StockPostingEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StockPostingEngine")
            .field("guard", &self.guard)
            .field("writer", &self.writer)
            .finish_non_exhaustive()
    }
}

impl StockPostingEngine {
    pub fn new(catalog: Arc<dyn Catalog>, accounting: Arc<dyn AccountingPublisher>) -> Self {
        Self::with_cache(catalog, accounting, StockCacheUpdater::default())
    }

    pub fn with_cache(
        catalog: Arc<dyn Catalog>,
        accounting: Arc<dyn AccountingPublisher>,
        cache: StockCacheUpdater,
    ) -> Self {
        Self {
            catalog,
            guard: ConcurrencyGuard::new(cache.clone()),
            writer: LedgerWriter::new(cache),
            accounting,
        }
    }

    pub fn guard(&self) -> &ConcurrencyGuard {
        &self.guard
    }

    /// Validate `document` and derive its stock legs through the catalog.
    pub fn target_lines(&self, document: &Document) -> Result<Vec<TargetLine>, WorkflowError> {
        let business_id = document.business_id;
        document.target_lines(|product| {
            self.catalog
                .resolve_product(business_id, product)
                .map(|info| info.tracking())
                .map_err(WorkflowError::from)
        })
    }

    /// Plan the rows that bring a reference to `target` without writing them.
    ///
    /// Row-locks every affected key; the caller holds the stock lock.
    pub fn plan(
        &self,
        tx: &mut dyn StockTx,
        reference_type: ReferenceType,
        reference_id: ReferenceId,
        target: Option<&Document>,
    ) -> Result<PostingPlan, WorkflowError> {
        self.build_plan(tx, reference_type, reference_id, target, KeyLocks::Acquire)
    }

    /// Availability dry run for a document write.
    ///
    /// Reads the ledger only: no summary row is created or locked, so keys
    /// the change would reach stay untouched until a movement is posted.
    pub fn check(
        &self,
        tx: &mut dyn StockTx,
        reference_type: ReferenceType,
        reference_id: ReferenceId,
        target: Option<&Document>,
    ) -> Result<(), WorkflowError> {
        self.build_plan(tx, reference_type, reference_id, target, KeyLocks::Skip)?;
        Ok(())
    }

    fn build_plan(
        &self,
        tx: &mut dyn StockTx,
        reference_type: ReferenceType,
        reference_id: ReferenceId,
        target: Option<&Document>,
        locks: KeyLocks,
    ) -> Result<PostingPlan, WorkflowError> {
        let targets = match target {
            Some(document) => self.target_lines(document)?,
            None => Vec::new(),
        };
        let posted = tx.history_for_reference(reference_type, reference_id)?;

        let keys = affected_keys(&targets, &posted);
        if locks == KeyLocks::Acquire {
            self.guard.lock_keys(tx, &keys)?;
        }
        let mut ledgers = BTreeMap::new();
        for key in keys {
            let rows = tx.history_for_key(&key)?;
            ledgers.insert(key, rows);
        }

        let date = target
            .map(|d| d.date)
            .or_else(|| posted.first().map(|r| r.stock_date))
            .unwrap_or(NaiveDate::MIN);
        let request = PlanRequest {
            reference_type,
            reference_id,
            date,
            targets: &targets,
            posted: &posted,
        };
        Ok(plan_postings(&request, &ledgers)?)
    }

    /// Converge the ledger to the message's snapshot and record it applied.
    #[instrument(
        skip(self, tx, message),
        fields(
            message_id = %message.id(),
            reference_type = %message.reference_type(),
            reference_id = %message.reference_id(),
            action = %message.action()
        ),
        err
    )]
    pub fn apply(
        &self,
        tx: &mut dyn StockTx,
        message: &OutboxMessage,
    ) -> Result<ProcessOutcome, WorkflowError> {
        self.guard.lock_business(tx)?;
        if tx.is_message_applied(message.id())? {
            tx.record_message_applied(message)?;
            debug!("message already applied");
            return Ok(ProcessOutcome::AlreadyApplied);
        }

        let snapshot: DocumentSnapshot = message
            .decode_payload()
            .map_err(|e| WorkflowError::Payload(e.to_string()))?;
        let subject = check_snapshot(tx, message, &snapshot)?;
        let effective_date = subject.date;

        let target = match message.action() {
            OutboxAction::Delete => None,
            OutboxAction::Create | OutboxAction::Update => snapshot.posting_target(),
        };
        let plan = self.plan(tx, message.reference_type(), message.reference_id(), target)?;
        let written = self.writer.apply_plan(tx, plan)?;

        let journal = self.accounting.post_journal(
            tx,
            message.business_id(),
            effective_date,
            message.reference_id(),
            message.reference_type(),
            snapshot.current.as_ref(),
            snapshot.previous.as_ref(),
            message.action(),
        )?;
        tx.record_message_applied(message)?;

        info!(
            reversed = written.reversed,
            posted = written.posted,
            journal_posted = journal.is_some(),
            "outbox message applied"
        );
        Ok(ProcessOutcome::Applied {
            reversed: written.reversed,
            posted: written.posted,
            journal_posted: journal.is_some(),
        })
    }
}

/// The snapshot must describe the message's own reference and business.
fn check_snapshot<'s>(
    tx: &dyn StockTx,
    message: &OutboxMessage,
    snapshot: &'s DocumentSnapshot,
) -> Result<&'s Document, WorkflowError> {
    let subject = snapshot
        .subject()
        .ok_or_else(|| WorkflowError::Payload("snapshot holds no document".to_string()))?;

    for document in [snapshot.current.as_ref(), snapshot.previous.as_ref()].into_iter().flatten() {
        if document.business_id != message.business_id() || document.business_id != tx.business_id() {
            return Err(DocumentError::BusinessMismatch {
                expected: tx.business_id(),
                actual: document.business_id,
            }
            .into());
        }
        if document.reference_type != message.reference_type()
            || document.reference_id != message.reference_id()
        {
            return Err(DocumentError::InconsistentSnapshot(format!(
                "document {} {} carried by message for {} {}",
                document.reference_type,
                document.reference_id,
                message.reference_type(),
                message.reference_id()
            ))
            .into());
        }
    }
    Ok(subject)
}
