//! Ledger write path: locking, cached totals and append-only history rows.
//!
//! Everything here runs inside a [`StockTx`](crate::store::StockTx) opened by
//! a workflow; nothing commits on its own.

pub mod cache;
pub mod guard;
pub mod writer;

pub use cache::{RecordIntegrationEvent, StockCacheUpdater, StockIntegrationHook};
pub use guard::ConcurrencyGuard;
pub use writer::{LedgerWriter, PlanOutcome};
