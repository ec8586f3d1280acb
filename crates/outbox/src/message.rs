use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use stockbook_core::{BusinessId, MessageId, OutboxAction, ReferenceId, ReferenceType};

/// A message about to be written to the outbox.
///
/// Built by the document write path; the store assigns the creation order
/// (`sequence`) and timestamps when it inserts the row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOutboxMessage<P = serde_json::Value> {
    pub id: MessageId,
    pub business_id: BusinessId,
    pub reference_type: ReferenceType,
    pub reference_id: ReferenceId,
    pub action: OutboxAction,
    pub payload: P,
}

impl<P> NewOutboxMessage<P> {
    pub fn new(
        business_id: BusinessId,
        reference_type: ReferenceType,
        reference_id: ReferenceId,
        action: OutboxAction,
        payload: P,
    ) -> Self {
        Self {
            id: MessageId::new(),
            business_id,
            reference_type,
            reference_id,
            action,
            payload,
        }
    }
}

impl<P: Serialize> NewOutboxMessage<P> {
    /// Serialize the payload into the stored JSON form.
    pub fn into_json(self) -> Result<NewOutboxMessage, serde_json::Error> {
        Ok(NewOutboxMessage {
            id: self.id,
            business_id: self.business_id,
            reference_type: self.reference_type,
            reference_id: self.reference_id,
            action: self.action,
            payload: serde_json::to_value(self.payload)?,
        })
    }
}

/// A committed outbox row (`PubSubMessageRecord`).
///
/// Notes:
/// - **Multi-tenancy** is enforced here via `business_id`.
/// - `sequence` is the global creation order; consumers only rely on it
///   being increasing per reference.
/// - `payload` is a snapshot sufficient to recompute the document's effects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage<P = serde_json::Value> {
    id: MessageId,
    business_id: BusinessId,
    reference_type: ReferenceType,
    reference_id: ReferenceId,
    action: OutboxAction,
    sequence: i64,
    created_at: DateTime<Utc>,
    payload: P,
}

impl<P> OutboxMessage<P> {
    pub fn from_new(new: NewOutboxMessage<P>, sequence: i64, created_at: DateTime<Utc>) -> Self {
        Self {
            id: new.id,
            business_id: new.business_id,
            reference_type: new.reference_type,
            reference_id: new.reference_id,
            action: new.action,
            sequence,
            created_at,
            payload: new.payload,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn business_id(&self) -> BusinessId {
        self.business_id
    }

    pub fn reference_type(&self) -> ReferenceType {
        self.reference_type
    }

    pub fn reference_id(&self) -> ReferenceId {
        self.reference_id
    }

    pub fn action(&self) -> OutboxAction {
        self.action
    }

    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }
}

impl OutboxMessage<serde_json::Value> {
    /// Deserialize the stored JSON payload into a typed snapshot.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}
