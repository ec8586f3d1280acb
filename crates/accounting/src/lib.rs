//! Accounting model for inventory journals (double-entry).
//!
//! Pure domain logic only: no IO, no HTTP, no persistence concerns.

pub mod journal;

pub use journal::{
    CounterAccounts, JournalEntry, JournalError, JournalLine, inventory_lines, net_by_account,
};
