//! Asynchronous workflow processors.
//!
//! An outbox message carries a document snapshot. Its processor converges
//! the ledger to that snapshot inside one transaction: stock lock, row
//! locks, reversals and new rows, cache increments, the inventory journal
//! and the applied-message marker commit together or not at all.

pub mod accounting;
pub mod dispatcher;
pub mod engine;
pub mod processors;

use thiserror::Error;

use stockbook_core::ReferenceType;
use stockbook_inventory::{DocumentError, PlanError, StockShortfall};
use stockbook_outbox::OutboxMessage;

use crate::catalog::CatalogError;
use crate::store::{StockTx, StoreError};

pub use accounting::{AccountingPublisher, InventoryJournalPublisher, NoopAccountingPublisher};
pub use dispatcher::WorkflowDispatcher;
pub use engine::StockPostingEngine;
pub use processors::{
    BillProcessor, CreditNoteProcessor, InventoryAdjustmentProcessor, InvoiceProcessor,
    OpeningStockProcessor, SupplierCreditProcessor, TransferOrderProcessor,
};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("invalid document: {0}")]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    InsufficientStock(#[from] StockShortfall),

    #[error("ledger inconsistency: {0}")]
    Inconsistent(String),

    #[error("malformed outbox payload: {0}")]
    Payload(String),

    #[error("no workflow processor registered for {0}")]
    Unrouted(ReferenceType),

    #[error("journal rejected: {0}")]
    Accounting(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<PlanError> for WorkflowError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::InsufficientStock(shortfall) => WorkflowError::InsufficientStock(shortfall),
            inconsistent @ PlanError::Inconsistent { .. } => {
                WorkflowError::Inconsistent(inconsistent.to_string())
            }
        }
    }
}

impl WorkflowError {
    /// Whether a later attempt of the same message may succeed.
    ///
    /// Shortfalls retry: an earlier receipt may still be on its way through
    /// the outbox.
    pub fn is_retriable(&self) -> bool {
        match self {
            WorkflowError::Store(err) => err.is_transient(),
            WorkflowError::Catalog(err) => err.is_transient(),
            WorkflowError::InsufficientStock(_) => true,
            WorkflowError::Document(_)
            | WorkflowError::Inconsistent(_)
            | WorkflowError::Payload(_)
            | WorkflowError::Unrouted(_)
            | WorkflowError::Accounting(_) => false,
        }
    }
}

/// What a processor did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Applied {
        reversed: usize,
        posted: usize,
        journal_posted: bool,
    },
    /// The message had already been applied; only its status was settled.
    AlreadyApplied,
}

/// Applies outbox messages of one reference type.
pub trait WorkflowProcessor: Send + Sync {
    fn reference_type(&self) -> ReferenceType;

    fn process(
        &self,
        tx: &mut dyn StockTx,
        message: &OutboxMessage,
    ) -> Result<ProcessOutcome, WorkflowError>;
}
