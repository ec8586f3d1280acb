//! One workflow processor per reference type.
//!
//! The processors share the posting pipeline; they differ in the reference
//! type they accept and in the legs the document produces.

use std::sync::Arc;

use stockbook_core::ReferenceType;
use stockbook_outbox::OutboxMessage;

use super::engine::StockPostingEngine;
use super::{ProcessOutcome, WorkflowError, WorkflowProcessor};
use crate::store::StockTx;

macro_rules! document_processor {
    ($(#[$meta:meta])* $name:ident => $reference_type:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $name {
            engine: Arc<StockPostingEngine>,
        }

        impl $name {
            pub fn new(engine: Arc<StockPostingEngine>) -> Self {
                Self { engine }
            }
        }

        impl WorkflowProcessor for $name {
            fn reference_type(&self) -> ReferenceType {
                $reference_type
            }

            fn process(
                &self,
                tx: &mut dyn StockTx,
                message: &OutboxMessage,
            ) -> Result<ProcessOutcome, WorkflowError> {
                if message.reference_type() != $reference_type {
                    return Err(WorkflowError::Unrouted(message.reference_type()));
                }
                self.engine.apply(tx, message)
            }
        }
    };
}

document_processor!(
    /// Opening balances: one receipt per line into the opening bucket.
    OpeningStockProcessor => ReferenceType::OpeningStock
);

document_processor!(
    /// Vendor bills: receipts at the billed unit cost.
    BillProcessor => ReferenceType::Bill
);

document_processor!(
    /// Returns to a vendor: issues valued from the FIFO layers.
    SupplierCreditProcessor => ReferenceType::SupplierCredit
);

document_processor!(
    /// Sales invoices: issues into the sale bucket, costed FIFO.
    InvoiceProcessor => ReferenceType::Invoice
);

document_processor!(
    /// Customer returns: receipts at the returned unit cost.
    CreditNoteProcessor => ReferenceType::CreditNote
);

document_processor!(
    /// Warehouse transfers. Each line is an issue at the source and a
    /// receipt at the destination carrying the consumed cost layers.
    TransferOrderProcessor => ReferenceType::TransferOrder
);

document_processor!(
    /// Stock counts and write-offs. Positive lines add stock at the stated
    /// cost; negative lines remove it at FIFO cost.
    InventoryAdjustmentProcessor => ReferenceType::InventoryAdjustment
);

/// A processor for every reference type.
pub fn standard_processors(engine: &Arc<StockPostingEngine>) -> Vec<Box<dyn WorkflowProcessor>> {
    vec![
        Box::new(OpeningStockProcessor::new(engine.clone())),
        Box::new(BillProcessor::new(engine.clone())),
        Box::new(SupplierCreditProcessor::new(engine.clone())),
        Box::new(InvoiceProcessor::new(engine.clone())),
        Box::new(CreditNoteProcessor::new(engine.clone())),
        Box::new(TransferOrderProcessor::new(engine.clone())),
        Box::new(InventoryAdjustmentProcessor::new(engine.clone())),
    ]
}
