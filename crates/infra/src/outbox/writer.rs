use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use stockbook_core::OutboxAction;
use stockbook_inventory::{Document, DocumentError, DocumentSnapshot};
use stockbook_outbox::{NewOutboxMessage, OutboxMessage};

use crate::store::{StockTx, StoreError};
use crate::workflow::{StockPostingEngine, WorkflowError};

/// Rejection of a document write. Nothing was queued and the caller's
/// transaction must roll back.
#[derive(Debug, Error)]
pub enum OutboxWriteError {
    #[error("document identity changed between versions: {0}")]
    IdentityChanged(String),

    #[error(transparent)]
    Rejected(#[from] WorkflowError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to encode document snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<DocumentError> for OutboxWriteError {
    fn from(err: DocumentError) -> Self {
        OutboxWriteError::Rejected(err.into())
    }
}

/// Queues document changes for the workflow processors.
///
/// Runs inside the transaction that commits the document itself. Only
/// changes that touch a posting status produce a message:
///
/// | previous    | current     | action   |
/// |-------------|-------------|----------|
/// | not posting | not posting | none     |
/// | not posting | posting     | create   |
/// | posting     | posting     | update   |
/// | posting     | not posting | delete   |
#[derive(Debug, Clone)]
pub struct OutboxWriter {
    engine: Arc<StockPostingEngine>,
}

impl OutboxWriter {
    pub fn new(engine: Arc<StockPostingEngine>) -> Self {
        Self { engine }
    }

    /// Validate the change and insert its outbox message.
    ///
    /// `previous` is the stored version before the write (`None` for a new
    /// document), `current` the version being committed (`None` when the
    /// document is deleted). Edits and deletions are checked against the
    /// ledger as of the document date before anything is queued.
    pub fn record(
        &self,
        tx: &mut dyn StockTx,
        previous: Option<&Document>,
        current: Option<&Document>,
    ) -> Result<Option<OutboxMessage>, OutboxWriteError> {
        check_identity(tx, previous, current)?;

        let was_posting = previous.is_some_and(|d| d.status.is_posting());
        let is_posting = current.is_some_and(|d| d.status.is_posting());
        let action = match (was_posting, is_posting) {
            (false, false) => {
                debug!("document change does not touch stock");
                return Ok(None);
            }
            (false, true) => OutboxAction::Create,
            (true, true) => OutboxAction::Update,
            (true, false) => OutboxAction::Delete,
        };

        let target = current.filter(|d| d.status.is_posting());
        if let Some(document) = target {
            self.engine.target_lines(document)?;
        }

        let Some(subject) = current.or(previous) else {
            return Ok(None);
        };

        if action != OutboxAction::Create {
            // Stock consumed by later documents may depend on this one.
            self.engine.guard().lock_business(tx)?;
            self.engine
                .check(tx, subject.reference_type, subject.reference_id, target)?;
        }

        let snapshot = DocumentSnapshot {
            current: current.cloned(),
            previous: previous.cloned(),
        };
        let new = NewOutboxMessage::new(
            subject.business_id,
            subject.reference_type,
            subject.reference_id,
            action,
            snapshot,
        )
        .into_json()?;
        let message = tx.insert_outbox(new)?;

        info!(
            message_id = %message.id(),
            reference_type = %message.reference_type(),
            reference_id = %message.reference_id(),
            action = %action,
            "outbox message queued"
        );
        Ok(Some(message))
    }
}

fn check_identity(
    tx: &dyn StockTx,
    previous: Option<&Document>,
    current: Option<&Document>,
) -> Result<(), OutboxWriteError> {
    for document in [previous, current].into_iter().flatten() {
        if document.business_id != tx.business_id() {
            return Err(DocumentError::BusinessMismatch {
                expected: tx.business_id(),
                actual: document.business_id,
            }
            .into());
        }
    }
    if let (Some(old), Some(new)) = (previous, current) {
        if old.reference_type != new.reference_type || old.reference_id != new.reference_id {
            return Err(OutboxWriteError::IdentityChanged(format!(
                "{} {} became {} {}",
                old.reference_type, old.reference_id, new.reference_type, new.reference_id
            )));
        }
    }
    Ok(())
}
