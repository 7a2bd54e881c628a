//! Durable message store: the source of truth for delivery status.
//!
//! Defines the [`Message`] row, the three-state [`MessageStatus`] machine and
//! the [`MessageStore`] contract consumed by the delivery engine and the
//! reconciler. Status changes are handed out as open [`StatusTransition`]s so
//! the caller can interleave a non-transactional side effect before choosing
//! to commit or roll back.

pub mod sqlite;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use self::sqlite::SqliteMessageStore;

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// Delivery status of a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Waiting to be picked up by the delivery engine.
    Pending,
    /// Claimed for delivery; the outbound send may or may not have happened.
    Sending,
    /// Delivered. Terminal.
    Sent,
}

impl MessageStatus {
    /// Every status, in state-machine order.
    pub const ALL: [Self; 3] = [Self::Pending, Self::Sending, Self::Sent];

    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Sent => "sent",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "sending" => Ok(Self::Sending),
            "sent" => Ok(Self::Sent),
            other => Err(StoreError::InvalidEnum {
                field: "status",
                value: other.to_owned(),
            }),
        }
    }

    /// Whether `self -> next` is an edge of the delivery state machine.
    ///
    /// The only edges are `Pending -> Sending`, `Sending -> Pending`
    /// (rollback after a failed send) and `Sending -> Sent`.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Sending)
                | (Self::Sending, Self::Pending)
                | (Self::Sending, Self::Sent)
        )
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        self == Self::Sent
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Stable unique identity.
    pub id: String,
    /// Destination passed to the external sender.
    pub recipient: String,
    /// Message body.
    pub content: String,
    /// Current delivery status.
    pub status: MessageStatus,
    /// When the producer enqueued the message.
    pub created_at: DateTime<Utc>,
    /// Set only on the transition into [`MessageStatus::Sent`].
    pub sent_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from durable store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// No message with the given id exists.
    #[error("message {0} not found")]
    NotFound(String),

    /// The row no longer holds the status the transition expected.
    #[error("message {id} is {actual}, expected {expected}")]
    Conflict {
        /// Message id.
        id: String,
        /// Status the caller expected to move away from.
        expected: MessageStatus,
        /// Status actually found in the store.
        actual: MessageStatus,
    },

    /// The requested edge is not part of the state machine.
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition {
        /// Source status.
        from: MessageStatus,
        /// Requested target status.
        to: MessageStatus,
    },

    /// An invalid enum value was read from the database.
    #[error("invalid {field} value: {value:?}")]
    InvalidEnum {
        /// Which field contained the bad value.
        field: &'static str,
        /// The unexpected value.
        value: String,
    },

    /// A stored timestamp could not be parsed.
    #[error("invalid timestamp {value:?}: {reason}")]
    InvalidTimestamp {
        /// Raw stored value.
        value: String,
        /// Parser message.
        reason: String,
    },
}

impl StoreError {
    /// True when the row has already moved on (or vanished), i.e. somebody
    /// else finalized it. Distinct from a fault in the store itself.
    pub fn is_superseded(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::NotFound(_))
    }
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// An uncommitted single-row status change.
///
/// Consumed by [`commit`](Self::commit) or [`rollback`](Self::rollback).
/// Dropping it without either rolls the change back.
#[async_trait]
pub trait StatusTransition: Send {
    /// Id of the message being changed.
    fn message_id(&self) -> &str;

    /// Status the row will hold once committed.
    fn target(&self) -> MessageStatus;

    /// Timestamp recorded by this change (written to `sent_at` for `Sent`).
    fn changed_at(&self) -> DateTime<Utc>;

    /// Make the change durable.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the commit fails.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Discard the change.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the rollback fails.
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Transactional persistence of messages and their status.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Up to `limit` pending messages, oldest first.
    async fn fetch_pending(&self, limit: u32) -> Result<Vec<Message>, StoreError>;

    /// Every message currently in [`MessageStatus::Sending`], oldest first.
    async fn fetch_sending(&self) -> Result<Vec<Message>, StoreError>;

    /// Begin moving message `id` from `from` to `to`.
    ///
    /// The returned transition holds the row change uncommitted.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidTransition`] if `from -> to` is not an edge.
    /// - [`StoreError::NotFound`] if the message does not exist.
    /// - [`StoreError::Conflict`] if the row is not currently in `from`.
    async fn transition(
        &self,
        id: &str,
        from: MessageStatus,
        to: MessageStatus,
    ) -> Result<Box<dyn StatusTransition>, StoreError>;
}
