//! SQLite-backed [`MessageStore`].
//!
//! The schema is applied inline via `include_str!` on open. Timestamps are
//! stored as RFC 3339 UTC text with fixed microsecond precision, so ordering
//! by the text column is chronological.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::trace;

use super::{Message, MessageStatus, MessageStore, StatusTransition, StoreError};

/// Pool size. One connection may sit inside an open transition while the
/// reconciler and the query surface keep reading.
const MAX_CONNECTIONS: u32 = 4;

/// How long a writer waits on SQLite's write lock before giving up.
///
/// The engine holds the lock for the whole external send, so this must
/// outlast the sender's timeout or concurrent writers fail with
/// `database is locked`.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const SELECT_MESSAGE: &str =
    "SELECT id, recipient, content, status, created_at, sent_at FROM messages";

/// Durable message queue in a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    /// Open (or create) the database at `path` and apply the schema, with
    /// [`DEFAULT_BUSY_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created, the
    /// database cannot be opened, or the migration fails.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        Self::open_with(path, DEFAULT_BUSY_TIMEOUT).await
    }

    /// Like [`open`](Self::open), waiting up to `busy_timeout` for the write
    /// lock.
    ///
    /// # Errors
    ///
    /// Same as [`open`](Self::open).
    pub async fn open_with(path: &Path, busy_timeout: Duration) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create database directory {}", parent.display())
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(busy_timeout)
            .pragma("trusted_schema", "OFF");

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open message store at {}", path.display()))?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, applying the schema if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the migration fails.
    pub async fn from_pool(pool: SqlitePool) -> anyhow::Result<Self> {
        let migration_sql = include_str!("../../migrations/001_messages.sql");
        sqlx::raw_sql(migration_sql)
            .execute(&pool)
            .await
            .context("failed to apply message schema migration")?;
        Ok(Self { pool })
    }

    /// Underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Producer-side insert of a new pending message.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    pub async fn enqueue(&self, recipient: &str, content: &str) -> Result<Message, StoreError> {
        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            recipient: recipient.to_owned(),
            content: content.to_owned(),
            status: MessageStatus::Pending,
            created_at: Utc::now(),
            sent_at: None,
        };
        self.insert(&message).await?;
        Ok(message)
    }

    /// Insert a message row exactly as given.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails (e.g. duplicate id).
    pub async fn insert(&self, message: &Message) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO messages (id, recipient, content, status, created_at, sent_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&message.id)
        .bind(&message.recipient)
        .bind(&message.content)
        .bind(message.status.as_str())
        .bind(format_timestamp(message.created_at))
        .bind(message.sent_at.map(format_timestamp))
        .execute(&self.pool)
        .await?;

        trace!(message_id = %message.id, status = %message.status, "message inserted");
        Ok(())
    }

    /// Look a message up by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the row is malformed.
    pub async fn get(&self, id: &str) -> Result<Option<Message>, StoreError> {
        let row: Option<MessageRow> = sqlx::query_as(&format!("{SELECT_MESSAGE} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(message_row_into_message).transpose()
    }

    /// All messages in `status`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or a row is malformed.
    pub async fn list_by_status(&self, status: MessageStatus) -> Result<Vec<Message>, StoreError> {
        self.select_by_status(status, None).await
    }

    async fn select_by_status(
        &self,
        status: MessageStatus,
        limit: Option<u32>,
    ) -> Result<Vec<Message>, StoreError> {
        // SQLite treats a negative LIMIT as "no limit".
        let limit = limit.map_or(-1, i64::from);
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "{SELECT_MESSAGE} WHERE status = ?1 ORDER BY created_at ASC, id ASC LIMIT ?2"
        ))
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(message_row_into_message).collect()
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn fetch_pending(&self, limit: u32) -> Result<Vec<Message>, StoreError> {
        self.select_by_status(MessageStatus::Pending, Some(limit)).await
    }

    async fn fetch_sending(&self) -> Result<Vec<Message>, StoreError> {
        self.select_by_status(MessageStatus::Sending, None).await
    }

    async fn transition(
        &self,
        id: &str,
        from: MessageStatus,
        to: MessageStatus,
    ) -> Result<Box<dyn StatusTransition>, StoreError> {
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition { from, to });
        }

        let changed_at = Utc::now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE messages SET
                status = ?1,
                sent_at = CASE WHEN ?1 = 'sent' THEN ?2 ELSE sent_at END
             WHERE id = ?3 AND status = ?4",
        )
        .bind(to.as_str())
        .bind(format_timestamp(changed_at))
        .bind(id)
        .bind(from.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let current: Option<(String,)> =
                sqlx::query_as("SELECT status FROM messages WHERE id = ?1")
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;

            return match current {
                None => Err(StoreError::NotFound(id.to_owned())),
                Some((actual,)) => Err(StoreError::Conflict {
                    id: id.to_owned(),
                    expected: from,
                    actual: MessageStatus::parse(&actual)?,
                }),
            };
        }

        Ok(Box::new(SqliteTransition {
            tx,
            message_id: id.to_owned(),
            target: to,
            changed_at,
        }))
    }
}

/// Open SQLite transaction holding one status update.
struct SqliteTransition {
    tx: Transaction<'static, Sqlite>,
    message_id: String,
    target: MessageStatus,
    changed_at: DateTime<Utc>,
}

#[async_trait]
impl StatusTransition for SqliteTransition {
    fn message_id(&self) -> &str {
        &self.message_id
    }

    fn target(&self) -> MessageStatus {
        self.target
    }

    fn changed_at(&self) -> DateTime<Utc> {
        self.changed_at
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.tx.commit().await?;
        trace!(message_id = %this.message_id, status = %this.target, "transition committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.tx.rollback().await?;
        trace!(message_id = %this.message_id, status = %this.target, "transition rolled back");
        Ok(())
    }
}

/// Raw row tuple from the `messages` table.
type MessageRow = (String, String, String, String, String, Option<String>);

fn message_row_into_message(row: MessageRow) -> Result<Message, StoreError> {
    let (id, recipient, content, status, created_at, sent_at) = row;
    Ok(Message {
        id,
        recipient,
        content,
        status: MessageStatus::parse(&status)?,
        created_at: parse_timestamp(&created_at)?,
        sent_at: sent_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidTimestamp {
            value: raw.to_owned(),
            reason: e.to_string(),
        })
}
