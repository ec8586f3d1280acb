//! Stock ledger domain.
//!
//! Pure, deterministic rules for the append-only stock ledger (no IO, no
//! storage): ledger rows and their buckets, document snapshots and the legs
//! they imply, FIFO cost layers, as-of availability and posting plans.

pub mod availability;
pub mod bucket;
pub mod document;
pub mod fifo;
pub mod history;
pub mod key;
pub mod plan;
pub mod valuation;

pub use availability::{StockShortfall, check_availability};
pub use bucket::{Bucket, StockBuckets, buckets_from_ledger};
pub use document::{
    Document, DocumentError, DocumentLine, DocumentSnapshot, DocumentStatus, Leg,
    ProductTracking, TargetLine,
};
pub use fifo::{CostLayer, CostSlice, FifoBook, InsufficientLayers, LayerOrigin};
pub use history::{MovementFlags, NewMovement, StockHistory, sort_chronologically};
pub use key::{ProductKey, ProductType, StockKey};
pub use plan::{PlanError, PlanRequest, PostingPlan, affected_keys, plan};
pub use valuation::{
    RemainingLayer, TraceEntry, ValuationTotals, ValuationTrace, totals_as_of, trace,
};
