//! `stockbook-core`: shared building blocks of the stock ledger.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod reference;

pub use error::{DomainError, DomainResult};
pub use id::{
    AccountId, BusinessId, DetailId, JournalEntryId, MessageId, ProductId, ReferenceId,
    StockHistoryId, WarehouseId,
};
pub use reference::{OutboxAction, ReferenceType};
