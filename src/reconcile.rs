//! Reconciler: settles messages left in `Sending` by a crash or a failed
//! record write.
//!
//! For every `Sending` message the cache is checked with a point lookup:
//!
//! - record present: the send completed and was recorded, only the store
//!   lags; finalize the status ("adopt").
//! - record absent: open `Sending -> Sent`, write a synthesized record, then
//!   commit. A failed write rolls the transition back and the message is
//!   retried on the next sweep.
//!
//! The sender is never invoked from here.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheError, CompletionRecord, RecordCache};
use crate::store::{Message, MessageStatus, MessageStore, StoreError};

/// Reconciler tuning.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// Overall deadline for one sweep.
    pub sweep_timeout: Duration,
    /// Expiry applied to synthesized records. `None` keeps them indefinitely.
    pub record_ttl: Option<Duration>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            sweep_timeout: Duration::from_secs(60),
            record_ttl: None,
        }
    }
}

/// Tally of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Messages found in `Sending`.
    pub scanned: usize,
    /// Record was missing and has been synthesized; status is now `Sent`.
    pub synthesized: usize,
    /// Record already present; only the store status was finalized.
    pub adopted: usize,
    /// Finalized by someone else between the scan and the transition.
    pub skipped: usize,
    /// Left in `Sending` after a store or cache failure; retried next sweep.
    pub failed: usize,
}

/// Errors that fail a whole sweep.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Listing `Sending` messages failed.
    #[error("failed to scan sending messages: {0}")]
    Scan(#[source] StoreError),

    /// The sweep exceeded its deadline; open transactions were rolled back.
    #[error("reconciliation sweep did not finish within {0:?}")]
    Deadline(Duration),
}

/// Why a single message could not be settled.
#[derive(Debug, thiserror::Error)]
enum SettleError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

enum Settled {
    Synthesized,
    Adopted,
    Skipped,
}

/// Periodic convergence of store status and record cache.
pub struct Reconciler {
    store: Arc<dyn MessageStore>,
    cache: Arc<dyn RecordCache>,
    config: ReconcileConfig,
}

impl Reconciler {
    /// Assemble a reconciler.
    pub fn new(
        store: Arc<dyn MessageStore>,
        cache: Arc<dyn RecordCache>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            store,
            cache,
            config,
        }
    }

    /// Active tuning.
    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Run one sweep under the sweep deadline.
    ///
    /// Idempotent: a second sweep right after a successful one finds nothing
    /// in `Sending` and changes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Scan`] if `Sending` messages cannot be
    /// listed and [`ReconcileError::Deadline`] if the sweep overruns.
    /// Per-message failures are counted in the report instead.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport, ReconcileError> {
        tokio::time::timeout(self.config.sweep_timeout, self.sweep())
            .await
            .map_err(|_| ReconcileError::Deadline(self.config.sweep_timeout))?
    }

    /// Sweep every `interval` until `shutdown_rx` fires. Sweep errors are
    /// logged and the loop carries on.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_ms = u64::try_from(self.config.interval.as_millis()).unwrap_or(u64::MAX),
            "reconciler started"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.reconcile_once().await {
                        Ok(report) if report.scanned > 0 => {
                            info!(
                                scanned = report.scanned,
                                synthesized = report.synthesized,
                                adopted = report.adopted,
                                skipped = report.skipped,
                                failed = report.failed,
                                "reconciliation sweep"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "reconciliation sweep failed"),
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("reconciler shutting down");
                        break;
                    }
                }
            }
        }

        info!("reconciler stopped");
    }

    async fn sweep(&self) -> Result<ReconcileReport, ReconcileError> {
        let stranded = self
            .store
            .fetch_sending()
            .await
            .map_err(ReconcileError::Scan)?;
        let mut report = ReconcileReport {
            scanned: stranded.len(),
            ..ReconcileReport::default()
        };

        for message in &stranded {
            match self.settle(message).await {
                Ok(Settled::Synthesized) => {
                    report.synthesized = report.synthesized.saturating_add(1);
                }
                Ok(Settled::Adopted) => {
                    report.adopted = report.adopted.saturating_add(1);
                }
                Ok(Settled::Skipped) => {
                    report.skipped = report.skipped.saturating_add(1);
                }
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "failed to reconcile message");
                    report.failed = report.failed.saturating_add(1);
                }
            }
        }

        Ok(report)
    }

    async fn settle(&self, message: &Message) -> Result<Settled, SettleError> {
        let recorded = self.cache.exists(&message.id).await?;

        let finalize = match self
            .store
            .transition(&message.id, MessageStatus::Sending, MessageStatus::Sent)
            .await
        {
            Ok(finalize) => finalize,
            Err(e) if e.is_superseded() => {
                debug!(message_id = %message.id, reason = %e, "message already finalized");
                return Ok(Settled::Skipped);
            }
            Err(e) => return Err(e.into()),
        };

        if recorded {
            finalize.commit().await?;
            info!(message_id = %message.id, "adopted existing completion record");
            return Ok(Settled::Adopted);
        }

        let record = CompletionRecord::synthesized(message, finalize.changed_at());
        if let Err(e) = self.cache.put(&record, self.config.record_ttl).await {
            finalize.rollback().await?;
            return Err(e.into());
        }
        finalize.commit().await?;

        info!(message_id = %message.id, "synthesized completion record");
        Ok(Settled::Synthesized)
    }
}
