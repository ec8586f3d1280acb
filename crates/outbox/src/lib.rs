//! Transactional outbox message model.
//!
//! One business writes one message per mutating document operation; per
//! document type workflow processors consume them with at-least-once
//! delivery.

pub mod delivery;
pub mod message;

pub use delivery::{DeliveryFailure, DeliveryState, MessageStatus, OutboxRecord};
pub use message::{NewOutboxMessage, OutboxMessage};
