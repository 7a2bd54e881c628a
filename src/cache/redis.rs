//! Redis-backed [`RecordCache`].
//!
//! Each record lives under `sent_message:{id}` as a JSON string. Listing
//! walks the keyspace with `SCAN MATCH` and tolerates keys that expire
//! between the scan and the read.

use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::Client;
use async_trait::async_trait;
use tracing::{debug, info};

use super::{
    record_key, sort_records, CacheError, CompletionRecord, RecordCache, RECORD_KEY_PREFIX,
};

/// Deadline for establishing the connection and the initial PING.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// `COUNT` hint per `SCAN` round-trip.
const SCAN_BATCH: usize = 100;

/// Record cache on a Redis server.
#[derive(Clone)]
pub struct RedisRecordCache {
    conn: MultiplexedConnection,
}

impl std::fmt::Debug for RedisRecordCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisRecordCache").finish_non_exhaustive()
    }
}

impl RedisRecordCache {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379/0`) and verify the
    /// server answers.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Redis`] for a bad URL or refused connection and
    /// [`CacheError::Timeout`] if the server does not answer in time.
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = Client::open(url)?;
        let conn = tokio::time::timeout(CONNECT_TIMEOUT, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| CacheError::Timeout(CONNECT_TIMEOUT))??;

        let cache = Self { conn };
        cache.ping().await?;
        info!("record cache connected");
        Ok(cache)
    }

    /// Round-trip a `PING`.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is unreachable or slow.
    pub async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let reply: String = tokio::time::timeout(
            CONNECT_TIMEOUT,
            ::redis::cmd("PING").query_async(&mut conn),
        )
        .await
        .map_err(|_| CacheError::Timeout(CONNECT_TIMEOUT))??;
        debug!(reply = %reply, "redis ping");
        Ok(())
    }

    async fn scan_record_keys(&self) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{RECORD_KEY_PREFIX}*");
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once.
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }
}

#[async_trait]
impl RecordCache for RedisRecordCache {
    async fn put(
        &self,
        record: &CompletionRecord,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let payload = serde_json::to_string(record)?;
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(record_key(&record.message_id)).arg(payload);
        if let Some(ttl) = ttl {
            let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
            cmd.arg("PX").arg(millis);
        }

        let mut conn = self.conn.clone();
        let () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn exists(&self, id: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let count: i64 = ::redis::cmd("EXISTS")
            .arg(record_key(id))
            .query_async(&mut conn)
            .await?;
        Ok(count > 0)
    }

    async fn list_all(&self) -> Result<Vec<CompletionRecord>, CacheError> {
        let keys = self.scan_record_keys().await?;
        let mut conn = self.conn.clone();
        let mut records = Vec::with_capacity(keys.len());

        for key in keys {
            let raw: Option<String> = ::redis::cmd("GET").arg(&key).query_async(&mut conn).await?;
            // Expired between SCAN and GET.
            let Some(raw) = raw else {
                continue;
            };
            records.push(serde_json::from_str(&raw)?);
        }

        sort_records(&mut records);
        Ok(records)
    }

    async fn delete(&self, id: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _removed: i64 = ::redis::cmd("DEL")
            .arg(record_key(id))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
