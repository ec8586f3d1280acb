//! Source document snapshots and the stock legs they imply.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use stockbook_core::{BusinessId, DetailId, ReferenceId, ReferenceType, WarehouseId};

use crate::history::MovementFlags;
use crate::key::{ProductKey, StockKey};

/// Document lifecycle state; only confirmed documents move stock.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Draft,
    Confirmed,
    Void,
}

impl DocumentStatus {
    pub fn is_posting(&self) -> bool {
        matches!(self, DocumentStatus::Confirmed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentLine {
    pub detail_id: DetailId,
    pub product: ProductKey,
    #[serde(default)]
    pub batch_number: String,
    /// Positive for every document kind except adjustments, where the sign
    /// is the direction.
    pub quantity: Decimal,
    /// Required on incoming lines; issues are costed from FIFO layers.
    #[serde(default)]
    pub unit_cost: Option<Decimal>,
}

/// Snapshot of a stock-moving document, as carried in outbox payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub business_id: BusinessId,
    pub reference_type: ReferenceType,
    pub reference_id: ReferenceId,
    /// Effective date in the business's timezone.
    pub date: NaiveDate,
    pub status: DocumentStatus,
    /// Source warehouse for transfers.
    pub warehouse_id: WarehouseId,
    #[serde(default)]
    pub destination_warehouse_id: Option<WarehouseId>,
    pub lines: Vec<DocumentLine>,
}

/// Outbox payload: the document before and after the mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub current: Option<Document>,
    pub previous: Option<Document>,
}

impl DocumentSnapshot {
    /// Document whose identity (type, id, business) the message is about.
    pub fn subject(&self) -> Option<&Document> {
        self.current.as_ref().or(self.previous.as_ref())
    }

    /// The state stock should converge to, or `None` when nothing should remain posted.
    pub fn posting_target(&self) -> Option<&Document> {
        self.current.as_ref().filter(|d| d.status.is_posting())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("line {0}: quantity must be greater than zero")]
    NonPositiveQuantity(DetailId),

    #[error("line {0}: adjustment quantity must not be zero")]
    ZeroAdjustment(DetailId),

    #[error("line {0}: incoming line needs a unit cost")]
    MissingUnitCost(DetailId),

    #[error("line {0}: unit cost must not be negative")]
    NegativeUnitCost(DetailId),

    #[error("line {0} appears more than once")]
    DuplicateDetail(DetailId),

    #[error("line {detail_id}: product {product} is batch tracked and needs a batch number")]
    MissingBatch {
        detail_id: DetailId,
        product: ProductKey,
    },

    #[error("transfer order needs a destination warehouse")]
    MissingDestination,

    #[error("transfer order source and destination warehouse are the same")]
    SameWarehouseTransfer,

    #[error("{0} cannot carry a destination warehouse")]
    UnexpectedDestination(ReferenceType),

    #[error("document belongs to business {actual}, not {expected}")]
    BusinessMismatch {
        expected: BusinessId,
        actual: BusinessId,
    },

    #[error("snapshot is inconsistent: {0}")]
    InconsistentSnapshot(String),
}

/// How the catalog treats a product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductTracking {
    /// False for non-inventory items (services, ...); such lines post nothing.
    pub is_inventory_tracked: bool,
    pub is_batch_tracked: bool,
}

/// One side of a line's stock effect.
#[derive(Debug, Clone, PartialEq)]
pub struct Leg {
    pub key: StockKey,
    pub flags: MovementFlags,
    /// Magnitude, always positive.
    pub quantity: Decimal,
    /// `Some` for priced receipts; `None` when cost comes from FIFO layers
    /// (issues) or from the paired issue (transfer destination).
    pub unit_cost: Option<Decimal>,
}

/// Stock effect of one document line.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetLine {
    pub detail_id: DetailId,
    pub primary: Leg,
    /// Destination leg of a transfer, mirroring the primary leg's layers.
    pub mirror: Option<Leg>,
}

impl Document {
    fn is_incoming(&self, line: &DocumentLine) -> bool {
        match self.reference_type {
            ReferenceType::OpeningStock | ReferenceType::Bill | ReferenceType::CreditNote => true,
            ReferenceType::InventoryAdjustment => line.quantity > Decimal::ZERO,
            ReferenceType::Invoice | ReferenceType::SupplierCredit | ReferenceType::TransferOrder => {
                false
            }
        }
    }

    /// Catalog-independent checks, run before anything is written.
    pub fn validate(&self) -> Result<(), DocumentError> {
        match (self.reference_type, self.destination_warehouse_id) {
            (ReferenceType::TransferOrder, None) => return Err(DocumentError::MissingDestination),
            (ReferenceType::TransferOrder, Some(dest)) if dest == self.warehouse_id => {
                return Err(DocumentError::SameWarehouseTransfer);
            }
            (ReferenceType::TransferOrder, Some(_)) => {}
            (other, Some(_)) => return Err(DocumentError::UnexpectedDestination(other)),
            (_, None) => {}
        }

        let mut seen = HashSet::new();
        for line in &self.lines {
            if !seen.insert(line.detail_id) {
                return Err(DocumentError::DuplicateDetail(line.detail_id));
            }

            if self.reference_type == ReferenceType::InventoryAdjustment {
                if line.quantity.is_zero() {
                    return Err(DocumentError::ZeroAdjustment(line.detail_id));
                }
            } else if line.quantity <= Decimal::ZERO {
                return Err(DocumentError::NonPositiveQuantity(line.detail_id));
            }

            if self.is_incoming(line) {
                match line.unit_cost {
                    None => return Err(DocumentError::MissingUnitCost(line.detail_id)),
                    Some(cost) if cost < Decimal::ZERO => {
                        return Err(DocumentError::NegativeUnitCost(line.detail_id));
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }

    /// Derive the stock legs of every inventory-tracked line.
    ///
    /// `resolve` is the catalog lookup; its error type must absorb
    /// [`DocumentError`].
    pub fn target_lines<E, F>(&self, mut resolve: F) -> Result<Vec<TargetLine>, E>
    where
        F: FnMut(&ProductKey) -> Result<ProductTracking, E>,
        E: From<DocumentError>,
    {
        self.validate()?;

        let mut targets = Vec::with_capacity(self.lines.len());
        for line in &self.lines {
            let tracking = resolve(&line.product)?;
            if !tracking.is_inventory_tracked {
                continue;
            }

            let batch_number = if tracking.is_batch_tracked {
                let batch = line.batch_number.trim();
                if batch.is_empty() {
                    return Err(DocumentError::MissingBatch {
                        detail_id: line.detail_id,
                        product: line.product,
                    }
                    .into());
                }
                batch.to_string()
            } else {
                String::new()
            };

            let key = StockKey::new(self.business_id, self.warehouse_id, line.product, batch_number);
            let quantity = line.quantity.abs();

            let target = if self.is_incoming(line) {
                TargetLine {
                    detail_id: line.detail_id,
                    primary: Leg {
                        key,
                        flags: MovementFlags::RECEIPT,
                        quantity,
                        unit_cost: line.unit_cost,
                    },
                    mirror: None,
                }
            } else {
                let mirror = self.destination_warehouse_id.map(|dest| Leg {
                    key: key.in_warehouse(dest),
                    flags: MovementFlags::TRANSFER_IN,
                    quantity,
                    unit_cost: None,
                });
                TargetLine {
                    detail_id: line.detail_id,
                    primary: Leg {
                        key,
                        flags: MovementFlags::ISSUE,
                        quantity,
                        unit_cost: None,
                    },
                    mirror,
                }
            };
            targets.push(target);
        }
        Ok(targets)
    }
}
