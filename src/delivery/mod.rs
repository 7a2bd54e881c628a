//! Delivery engine: moves pending messages through the external sender.
//!
//! Each message goes through two store transitions wrapped around two
//! non-transactional side effects:
//!
//! 1. claim `Pending -> Sending`, held open while the sender runs, then
//!    committed on success or rolled back on failure;
//! 2. finalize `Sending -> Sent`, held open while the completion record is
//!    written to the cache, then committed on success or rolled back so the
//!    message stays `Sending` for the reconciler.
//!
//! A message is never re-sent once its claim has committed. The reconciler
//! (see [`crate::reconcile`]) settles anything left in `Sending`.

pub mod control;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::cache::{CompletionRecord, RecordCache};
use crate::sender::Sender;
use crate::store::{Message, MessageStatus, MessageStore, StoreError};

pub use self::control::{DeliveryControl, RunState};

/// Default number of messages claimed per tick.
pub const DEFAULT_BATCH_LIMIT: u32 = 2;

/// What the engine does when a tick fails on a store fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreFaultPolicy {
    /// Return the error from [`DeliveryEngine::run`] so the process exits.
    #[default]
    Halt,
    /// Log the error and keep ticking.
    Continue,
}

impl StoreFaultPolicy {
    /// Config-file spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Halt => "halt",
            Self::Continue => "continue",
        }
    }
}

impl fmt::Display for StoreFaultPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Maximum messages claimed per batch.
    pub batch_limit: u32,
    /// Time between ticks.
    pub tick_interval: Duration,
    /// Overall deadline for one batch.
    pub batch_timeout: Duration,
    /// Reaction to a store fault.
    pub on_store_error: StoreFaultPolicy,
    /// Expiry applied to completion records. `None` keeps them indefinitely.
    pub record_ttl: Option<Duration>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            batch_limit: DEFAULT_BATCH_LIMIT,
            tick_interval: Duration::from_secs(5),
            batch_timeout: Duration::from_secs(30),
            on_store_error: StoreFaultPolicy::Halt,
            record_ttl: None,
        }
    }
}

/// Tally of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Messages returned by `fetch_pending`.
    pub fetched: usize,
    /// Sent and recorded; store status is `Sent`.
    pub sent: usize,
    /// Send failed; message returned to `Pending`.
    pub deferred: usize,
    /// Sent, but the record write failed; message left in `Sending`.
    pub stranded: usize,
    /// Sent, but the reconciler finalized the message first.
    pub finalized_elsewhere: usize,
    /// Already `Sent` when observed; not touched.
    pub skipped: usize,
}

/// Errors that abort a batch.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The durable store failed.
    #[error("store fault: {0}")]
    Store(#[from] StoreError),

    /// The batch exceeded its deadline; open transactions were rolled back.
    #[error("batch did not finish within {0:?}")]
    Deadline(Duration),
}

/// Per-message result inside a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Sent,
    Deferred,
    Stranded,
    FinalizedElsewhere,
    Skipped,
}

impl BatchReport {
    fn record(&mut self, outcome: Outcome) {
        let slot = match outcome {
            Outcome::Sent => &mut self.sent,
            Outcome::Deferred => &mut self.deferred,
            Outcome::Stranded => &mut self.stranded,
            Outcome::FinalizedElsewhere => &mut self.finalized_elsewhere,
            Outcome::Skipped => &mut self.skipped,
        };
        *slot = slot.saturating_add(1);
    }
}

/// Periodic batch processor.
pub struct DeliveryEngine {
    store: Arc<dyn MessageStore>,
    cache: Arc<dyn RecordCache>,
    sender: Arc<dyn Sender>,
    control: Arc<DeliveryControl>,
    config: DeliveryConfig,
}

impl DeliveryEngine {
    /// Assemble an engine from its collaborators.
    pub fn new(
        store: Arc<dyn MessageStore>,
        cache: Arc<dyn RecordCache>,
        sender: Arc<dyn Sender>,
        control: Arc<DeliveryControl>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            store,
            cache,
            sender,
            control,
            config,
        }
    }

    /// Shared start/stop switch.
    pub fn control(&self) -> &Arc<DeliveryControl> {
        &self.control
    }

    /// Active tuning.
    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Process one batch of pending messages, regardless of the run state.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Store`] on any store fault other than a
    /// finalize that lost the race to the reconciler. Messages handled before
    /// the fault keep their committed state.
    pub async fn process_batch(&self) -> Result<BatchReport, DeliveryError> {
        let batch = self.store.fetch_pending(self.config.batch_limit).await?;
        let mut report = BatchReport {
            fetched: batch.len(),
            ..BatchReport::default()
        };

        for message in &batch {
            let outcome = self.deliver(message).await?;
            report.record(outcome);
        }

        debug!(
            fetched = report.fetched,
            sent = report.sent,
            deferred = report.deferred,
            stranded = report.stranded,
            "batch processed"
        );
        Ok(report)
    }

    /// Run one batch under the batch deadline if delivery is started.
    ///
    /// Returns `Ok(None)` without touching the store when stopped.
    ///
    /// # Errors
    ///
    /// Propagates [`process_batch`](Self::process_batch) errors and returns
    /// [`DeliveryError::Deadline`] when the batch overruns.
    pub async fn tick(&self) -> Result<Option<BatchReport>, DeliveryError> {
        if !self.control.is_running() {
            return Ok(None);
        }

        match tokio::time::timeout(self.config.batch_timeout, self.process_batch()).await {
            Ok(result) => result.map(Some),
            Err(_) => Err(DeliveryError::Deadline(self.config.batch_timeout)),
        }
    }

    /// Tick every `tick_interval` until `shutdown_rx` fires.
    ///
    /// Shutdown is observed between ticks only; an in-flight batch always
    /// finishes (or hits its deadline) first.
    ///
    /// # Errors
    ///
    /// Returns the store fault that stopped the loop under
    /// [`StoreFaultPolicy::Halt`].
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), DeliveryError> {
        info!(
            batch_limit = self.config.batch_limit,
            interval_ms = u64::try_from(self.config.tick_interval.as_millis()).unwrap_or(u64::MAX),
            on_store_error = %self.config.on_store_error,
            "delivery engine started"
        );

        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Skip the first immediate tick.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(Some(report)) if report.fetched > 0 => {
                            info!(
                                fetched = report.fetched,
                                sent = report.sent,
                                deferred = report.deferred,
                                stranded = report.stranded,
                                finalized_elsewhere = report.finalized_elsewhere,
                                "delivery tick"
                            );
                        }
                        Ok(_) => {}
                        Err(DeliveryError::Deadline(limit)) => {
                            warn!(timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX), "delivery batch timed out");
                        }
                        Err(e) => match self.config.on_store_error {
                            StoreFaultPolicy::Halt => {
                                error!(error = %e, "delivery engine halting on store fault");
                                return Err(e);
                            }
                            StoreFaultPolicy::Continue => {
                                error!(error = %e, "delivery tick failed");
                            }
                        },
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("delivery engine shutting down");
                        break;
                    }
                }
            }
        }

        info!("delivery engine stopped");
        Ok(())
    }

    async fn deliver(&self, message: &Message) -> Result<Outcome, DeliveryError> {
        if message.status.is_terminal() {
            debug!(message_id = %message.id, "message already sent, skipping");
            return Ok(Outcome::Skipped);
        }

        let claim = self
            .store
            .transition(&message.id, MessageStatus::Pending, MessageStatus::Sending)
            .await?;

        let receipt = match self.sender.send(&message.recipient, &message.content).await {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "send failed, returning message to pending");
                claim.rollback().await?;
                return Ok(Outcome::Deferred);
            }
        };
        claim.commit().await?;

        let finalize = match self
            .store
            .transition(&message.id, MessageStatus::Sending, MessageStatus::Sent)
            .await
        {
            Ok(finalize) => finalize,
            Err(e) if e.is_superseded() => {
                info!(message_id = %message.id, reason = %e, "message finalized by reconciler");
                return Ok(Outcome::FinalizedElsewhere);
            }
            Err(e) => return Err(e.into()),
        };

        let record = CompletionRecord::delivered(
            message,
            receipt.message_id.clone(),
            finalize.changed_at(),
        );
        if let Err(e) = self.cache.put(&record, self.config.record_ttl).await {
            error!(
                message_id = %message.id,
                error = %e,
                "failed to write completion record, leaving message in sending"
            );
            finalize.rollback().await?;
            return Ok(Outcome::Stranded);
        }
        finalize.commit().await?;

        info!(
            message_id = %message.id,
            external_response_id = %receipt.message_id,
            "message sent"
        );
        Ok(Outcome::Sent)
    }
}
