use chrono::{DateTime, Utc};
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use stockbook_core::DomainError;

use crate::message::OutboxMessage;

/// Delivery status of an outbox row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Waiting for (re)delivery.
    Pending,
    /// Applied by a workflow processor.
    Processed,
    /// Gave up after a permanent error or exhausted retries.
    DeadLettered,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Processed => "processed",
            MessageStatus::DeadLettered => "dead_lettered",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, MessageStatus::Pending)
    }
}

impl FromStr for MessageStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "processed" => Ok(MessageStatus::Processed),
            "dead_lettered" => Ok(MessageStatus::DeadLettered),
            other => Err(DomainError::validation(format!("unknown message status: {other}"))),
        }
    }
}

/// Delivery bookkeeping kept alongside each outbox row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryState {
    pub status: MessageStatus,
    /// Failed delivery attempts so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Earliest time the message may be claimed again.
    pub next_attempt_at: DateTime<Utc>,
    /// Lease held by the worker that claimed the message.
    pub claimed_until: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl DeliveryState {
    pub fn pending(now: DateTime<Utc>) -> Self {
        Self {
            status: MessageStatus::Pending,
            attempts: 0,
            last_error: None,
            next_attempt_at: now,
            claimed_until: None,
            processed_at: None,
        }
    }

    /// Whether a worker may claim the message at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == MessageStatus::Pending
            && self.next_attempt_at <= now
            && self.claimed_until.is_none_or(|until| until <= now)
    }
}

/// Outcome of a failed delivery, decided by the relay's retry policy.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryFailure {
    /// Try again no earlier than `next_attempt_at`.
    Retry {
        error: String,
        next_attempt_at: DateTime<Utc>,
    },
    /// Stop retrying; the message stays visible to operators.
    DeadLetter { error: String },
}

impl DeliveryFailure {
    pub fn error(&self) -> &str {
        match self {
            DeliveryFailure::Retry { error, .. } | DeliveryFailure::DeadLetter { error } => error,
        }
    }
}

/// An outbox row together with its delivery state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub message: OutboxMessage,
    pub delivery: DeliveryState,
}

impl DeliveryState {
    /// Apply a failed attempt in place.
    pub fn record_failure(&mut self, failure: &DeliveryFailure) {
        self.attempts += 1;
        self.claimed_until = None;
        self.last_error = Some(failure.error().to_string());
        match failure {
            DeliveryFailure::Retry { next_attempt_at, .. } => {
                self.next_attempt_at = *next_attempt_at;
            }
            DeliveryFailure::DeadLetter { .. } => {
                self.status = MessageStatus::DeadLettered;
            }
        }
    }
}
