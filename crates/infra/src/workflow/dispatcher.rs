use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use stockbook_core::ReferenceType;
use stockbook_outbox::OutboxMessage;

use super::engine::StockPostingEngine;
use super::processors::standard_processors;
use super::{ProcessOutcome, WorkflowError, WorkflowProcessor};
use crate::store::StockTx;

/// Routes outbox messages to the processor of their reference type.
#[derive(Default)]
pub struct WorkflowDispatcher {
    processors: HashMap<ReferenceType, Box<dyn WorkflowProcessor>>,
}

impl WorkflowDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatcher with the standard processor of every reference type.
    pub fn standard(engine: Arc<StockPostingEngine>) -> Self {
        let mut dispatcher = Self::new();
        for processor in standard_processors(&engine) {
            dispatcher.processors.insert(processor.reference_type(), processor);
        }
        dispatcher
    }

    /// Register (or replace) the processor of its reference type.
    pub fn register<P>(&mut self, processor: P)
    where
        P: WorkflowProcessor + 'static,
    {
        self.processors
            .insert(processor.reference_type(), Box::new(processor));
    }

    pub fn handles(&self, reference_type: ReferenceType) -> bool {
        self.processors.contains_key(&reference_type)
    }

    pub fn dispatch(
        &self,
        tx: &mut dyn StockTx,
        message: &OutboxMessage,
    ) -> Result<ProcessOutcome, WorkflowError> {
        let Some(processor) = self.processors.get(&message.reference_type()) else {
            warn!(
                message_id = %message.id(),
                reference_type = %message.reference_type(),
                "no workflow processor for message"
            );
            return Err(WorkflowError::Unrouted(message.reference_type()));
        };
        processor.process(tx, message)
    }
}
