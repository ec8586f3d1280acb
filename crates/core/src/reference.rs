//! Document kinds that move stock, and the mutations applied to them.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Kind of source document a ledger row or outbox message belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    OpeningStock,
    Bill,
    SupplierCredit,
    Invoice,
    CreditNote,
    TransferOrder,
    InventoryAdjustment,
}

impl ReferenceType {
    pub const ALL: [ReferenceType; 7] = [
        ReferenceType::OpeningStock,
        ReferenceType::Bill,
        ReferenceType::SupplierCredit,
        ReferenceType::Invoice,
        ReferenceType::CreditNote,
        ReferenceType::TransferOrder,
        ReferenceType::InventoryAdjustment,
    ];

    /// Stable storage name (also used as the serde tag).
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceType::OpeningStock => "opening_stock",
            ReferenceType::Bill => "bill",
            ReferenceType::SupplierCredit => "supplier_credit",
            ReferenceType::Invoice => "invoice",
            ReferenceType::CreditNote => "credit_note",
            ReferenceType::TransferOrder => "transfer_order",
            ReferenceType::InventoryAdjustment => "inventory_adjustment",
        }
    }
}

impl core::fmt::Display for ReferenceType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReferenceType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReferenceType::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown reference type: {s}")))
    }
}

/// Mutation recorded in an outbox message.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxAction {
    Create,
    Update,
    Delete,
}

impl OutboxAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxAction::Create => "create",
            OutboxAction::Update => "update",
            OutboxAction::Delete => "delete",
        }
    }
}

impl core::fmt::Display for OutboxAction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxAction {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(OutboxAction::Create),
            "update" => Ok(OutboxAction::Update),
            "delete" => Ok(OutboxAction::Delete),
            other => Err(DomainError::validation(format!("unknown outbox action: {other}"))),
        }
    }
}
