//! Transactional stock storage boundary.
//!
//! The posting engine talks to storage only through [`StockStore`] and the
//! business-scoped [`StockTx`] it hands out, so the same workflows run
//! against the in-memory store (tests/dev) and Postgres (production).

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryStockStore;
pub use postgres::{PostgresStockStore, apply_schema};
pub use r#trait::{
    DailyBalance, HistoryFilter, IntegrationEvent, STOCK_TRACKING_STARTED, StockStore,
    StockSummary, StockTx, StoreError, StoreResult, SummaryLock,
};
