//! Transactional outbox: the document write path queues messages, relays
//! deliver them to the workflow processors.
//!
//! ## Components
//!
//! - `OutboxWriter`: validates a document change and inserts its message in
//!   the document's own transaction
//! - `OutboxRelay`: claims due messages with a lease and dispatches them
//! - `RetryPolicy`: backoff and dead-letter decisions for failed deliveries
//!
//! Delivery is at least once. Processors are idempotent, so a message
//! redelivered after a lost acknowledgement is a no-op.

pub mod relay;
pub mod retry;
pub mod writer;

pub use relay::{OutboxRelay, RelayConfig, RelayHandle, RelayStats, RelayStep};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use writer::{OutboxWriteError, OutboxWriter};
