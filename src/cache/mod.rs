//! Record cache: the fast, non-transactional log of completed deliveries.
//!
//! A [`CompletionRecord`] asserts that a message reached
//! [`MessageStatus::Sent`]. Records are written by the delivery engine after
//! a live send, or synthesized by the reconciler when a crash left a message
//! stranded in `Sending`. The cache may lose records (expiry, eviction); the
//! durable store stays authoritative.
//!
//! Two backends:
//! - [`redis::RedisRecordCache`]: keys `sent_message:{id}` holding JSON
//! - [`memory::InMemoryRecordCache`]: process-local map, used in tests

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{Message, MessageStatus};

pub use self::memory::InMemoryRecordCache;
pub use self::redis::RedisRecordCache;

/// Key prefix shared by every completion record.
pub const RECORD_KEY_PREFIX: &str = "sent_message:";

/// Cache key for the record of message `id`.
pub fn record_key(id: &str) -> String {
    format!("{RECORD_KEY_PREFIX}{id}")
}

/// Projection of a message that reached `Sent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    /// Id of the delivered message.
    pub message_id: String,
    /// Identifier returned by the recipient. `None` when the record was
    /// synthesized during reconciliation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_response_id: Option<String>,
    /// Destination the message was sent to.
    pub recipient: String,
    /// Message body.
    pub content: String,
    /// Always [`MessageStatus::Sent`].
    pub status: MessageStatus,
    /// When the message was enqueued.
    pub created_at: DateTime<Utc>,
    /// When the message was marked sent.
    pub sent_at: DateTime<Utc>,
}

impl CompletionRecord {
    /// Record for a live send acknowledged by the recipient.
    pub fn delivered(message: &Message, response_id: String, sent_at: DateTime<Utc>) -> Self {
        Self::project(message, Some(response_id), sent_at)
    }

    /// Record rebuilt from the store alone; the recipient's response id is
    /// not recoverable after a crash.
    pub fn synthesized(message: &Message, sent_at: DateTime<Utc>) -> Self {
        Self::project(message, None, sent_at)
    }

    /// Whether this record came from reconciliation rather than a live send.
    pub fn is_synthesized(&self) -> bool {
        self.external_response_id.is_none()
    }

    fn project(
        message: &Message,
        external_response_id: Option<String>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: message.id.clone(),
            external_response_id,
            recipient: message.recipient.clone(),
            content: message.content.clone(),
            status: MessageStatus::Sent,
            created_at: message.created_at,
            sent_at,
        }
    }
}

/// Errors from record cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Redis connection or command failure.
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// A record could not be encoded or a stored value could not be decoded.
    #[error("record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backend did not answer in time.
    #[error("cache did not respond within {0:?}")]
    Timeout(Duration),

    /// The backend refused the operation.
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Write-mostly store of completion records.
///
/// Not transactional with the durable store. Every operation may fail
/// transiently; callers decide how a failure affects the status change they
/// are wrapping.
#[async_trait]
pub trait RecordCache: Send + Sync {
    /// Store `record` under its message id. `ttl = None` keeps it indefinitely.
    async fn put(&self, record: &CompletionRecord, ttl: Option<Duration>)
        -> Result<(), CacheError>;

    /// Whether a record exists for message `id`.
    async fn exists(&self, id: &str) -> Result<bool, CacheError>;

    /// Every record currently held, ordered by `sent_at` then `message_id`.
    async fn list_all(&self) -> Result<Vec<CompletionRecord>, CacheError>;

    /// Remove the record for message `id`, if any.
    async fn delete(&self, id: &str) -> Result<(), CacheError>;
}

/// Ordering used by every `list_all` implementation.
pub(crate) fn sort_records(records: &mut [CompletionRecord]) {
    records.sort_by(|a, b| {
        a.sent_at
            .cmp(&b.sent_at)
            .then_with(|| a.message_id.cmp(&b.message_id))
    });
}
