//! Process-local [`RecordCache`].

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{record_key, sort_records, CacheError, CompletionRecord, RecordCache};

#[derive(Debug)]
struct Entry {
    record: CompletionRecord,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-memory record cache with optional per-record expiry.
#[derive(Debug, Default)]
pub struct InMemoryRecordCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryRecordCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|e| e.is_live(now)).count()
    }

    /// True when no live record is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch the live record for message `id`.
    pub fn get(&self, id: &str) -> Option<CompletionRecord> {
        let now = Instant::now();
        self.lock()
            .get(&record_key(id))
            .filter(|e| e.is_live(now))
            .map(|e| e.record.clone())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RecordCache for InMemoryRecordCache {
    async fn put(
        &self,
        record: &CompletionRecord,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let expires_at = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
        self.lock().insert(
            record_key(&record.message_id),
            Entry {
                record: record.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn exists(&self, id: &str) -> Result<bool, CacheError> {
        Ok(self.get(id).is_some())
    }

    async fn list_all(&self) -> Result<Vec<CompletionRecord>, CacheError> {
        let now = Instant::now();
        let mut entries = self.lock();
        entries.retain(|_, e| e.is_live(now));
        let mut records: Vec<CompletionRecord> =
            entries.values().map(|e| e.record.clone()).collect();
        drop(entries);

        sort_records(&mut records);
        Ok(records)
    }

    async fn delete(&self, id: &str) -> Result<(), CacheError> {
        self.lock().remove(&record_key(id));
        Ok(())
    }
}
