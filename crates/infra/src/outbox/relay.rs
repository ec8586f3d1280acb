//! Outbox relay: claims outbox messages and hands them to the workflow
//! dispatcher, with retry, backoff and dead-lettering.

use std::io;
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use stockbook_core::BusinessId;
use stockbook_outbox::{DeliveryFailure, OutboxRecord};

use super::retry::RetryPolicy;
use crate::store::{StockStore, StoreError};
use crate::workflow::{ProcessOutcome, WorkflowDispatcher, WorkflowError};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Thread name and log label
    pub name: String,
    /// Sleep between polls when nothing is claimable
    pub poll_interval: Duration,
    /// How long a claimed message stays invisible to other relays
    pub lease: Duration,
    /// Optional business filter
    pub business_id: Option<BusinessId>,
    pub retry: RetryPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            name: "outbox-relay".to_string(),
            poll_interval: Duration::from_millis(200),
            lease: Duration::from_secs(30),
            business_id: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl RelayConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_business(mut self, business_id: BusinessId) -> Self {
        self.business_id = Some(business_id);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Relay runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RelayStats {
    pub messages_claimed: u64,
    pub messages_applied: u64,
    pub messages_already_applied: u64,
    pub messages_retried: u64,
    pub messages_dead_lettered: u64,
    pub uptime_secs: u64,
}

/// Result of one relay step.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayStep {
    /// Nothing was claimable.
    Idle,
    Delivered(ProcessOutcome),
    /// Processing failed; the failure was recorded on the message.
    Failed(DeliveryFailure),
}

/// Handle to control a running relay.
#[derive(Debug)]
pub struct RelayHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<RelayStats>>,
}

impl RelayHandle {
    /// Request graceful shutdown and wait for the current message to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Delivers outbox messages to the workflow processors.
///
/// Each delivery runs in its own business transaction; a failure rolls the
/// attempt back and is recorded on the message outside that transaction.
pub struct OutboxRelay<S: StockStore> {
    store: S,
    dispatcher: Arc<WorkflowDispatcher>,
    config: RelayConfig,
}

impl<S: StockStore + 'static> OutboxRelay<S> {
    pub fn new(store: S, dispatcher: Arc<WorkflowDispatcher>, config: RelayConfig) -> Self {
        Self {
            store,
            dispatcher,
            config,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Claim and deliver at most one message.
    pub fn run_once(&self) -> Result<RelayStep, StoreError> {
        let Some(record) = self
            .store
            .claim_next_message(self.config.business_id, self.config.lease)?
        else {
            return Ok(RelayStep::Idle);
        };
        self.deliver(record)
    }

    /// Deliver until nothing is claimable. Returns the number of steps taken.
    ///
    /// Messages scheduled for a later retry are not waited for.
    pub fn drain(&self) -> Result<usize, StoreError> {
        let mut steps = 0;
        while self.run_once()? != RelayStep::Idle {
            steps += 1;
        }
        Ok(steps)
    }

    fn deliver(&self, record: OutboxRecord) -> Result<RelayStep, StoreError> {
        let message = &record.message;
        debug!(
            relay = %self.config.name,
            message_id = %message.id(),
            reference_type = %message.reference_type(),
            attempts = record.delivery.attempts,
            "claimed outbox message"
        );

        let dispatcher = &self.dispatcher;
        let result: Result<ProcessOutcome, WorkflowError> = self
            .store
            .transact(message.business_id(), |tx| dispatcher.dispatch(tx, message));

        match result {
            Ok(outcome) => Ok(RelayStep::Delivered(outcome)),
            Err(err) => {
                let attempt = record.delivery.attempts + 1;
                let failure = self.config.retry.failure_for(
                    attempt,
                    err.is_retriable(),
                    err.to_string(),
                    Utc::now(),
                );
                match &failure {
                    DeliveryFailure::Retry { next_attempt_at, .. } => warn!(
                        relay = %self.config.name,
                        message_id = %message.id(),
                        attempt,
                        next_attempt_at = %next_attempt_at,
                        error = %err,
                        "outbox delivery failed, will retry"
                    ),
                    DeliveryFailure::DeadLetter { .. } => error!(
                        relay = %self.config.name,
                        message_id = %message.id(),
                        attempt,
                        error = %err,
                        "outbox message dead-lettered"
                    ),
                }
                self.store.record_delivery_failure(message, &failure)?;
                Ok(RelayStep::Failed(failure))
            }
        }
    }

    /// Run the relay loop on a named background thread.
    pub fn spawn(self) -> io::Result<RelayHandle>
    where
        S: Send,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(RelayStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(self.config.name.clone())
            .spawn(move || relay_loop(self, shutdown_rx, stats_clone))?;

        Ok(RelayHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn relay_loop<S: StockStore + 'static>(
    relay: OutboxRelay<S>,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<RelayStats>>,
) {
    let name = relay.config.name.clone();
    info!(relay = %name, business_id = ?relay.config.business_id, "outbox relay started");
    let start_time = Instant::now();

    loop {
        let step = relay.run_once();

        let idle = {
            let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
            s.uptime_secs = start_time.elapsed().as_secs();
            match &step {
                Ok(RelayStep::Idle) => true,
                Ok(RelayStep::Delivered(outcome)) => {
                    s.messages_claimed += 1;
                    match outcome {
                        ProcessOutcome::Applied { .. } => s.messages_applied += 1,
                        ProcessOutcome::AlreadyApplied => s.messages_already_applied += 1,
                    }
                    false
                }
                Ok(RelayStep::Failed(failure)) => {
                    s.messages_claimed += 1;
                    match failure {
                        DeliveryFailure::Retry { .. } => s.messages_retried += 1,
                        DeliveryFailure::DeadLetter { .. } => s.messages_dead_lettered += 1,
                    }
                    false
                }
                Err(err) => {
                    error!(relay = %name, error = %err, "failed to claim outbox message");
                    true
                }
            }
        };

        let wait = if idle {
            relay.config.poll_interval
        } else {
            Duration::ZERO
        };
        match shutdown_rx.recv_timeout(wait) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
    }

    info!(relay = %name, "outbox relay stopped");
}
