//! Tests for `DeliveryEngine::process_batch` and `tick`.

use std::sync::Arc;
use std::time::Duration;

use herald::cache::{InMemoryRecordCache, RecordCache};
use herald::delivery::{DeliveryConfig, DeliveryControl, DeliveryEngine, DeliveryError};
use herald::reconcile::{ReconcileConfig, Reconciler};
use herald::sender::WebhookSender;
use herald::store::{MessageStatus, MessageStore, SqliteMessageStore};

use crate::common::{
    seed, spawn_accepting_webhook, status_of, temp_store, AuditingCache, FaultyCache,
    FaultyStore, ScriptedSender,
};

fn engine(
    store: Arc<dyn MessageStore>,
    cache: Arc<dyn RecordCache>,
    sender: Arc<ScriptedSender>,
    config: DeliveryConfig,
) -> DeliveryEngine {
    DeliveryEngine::new(
        store,
        cache,
        sender,
        Arc::new(DeliveryControl::new()),
        config,
    )
}

async fn seed_pending(store: &SqliteMessageStore, ids: &[&str]) {
    for (i, id) in ids.iter().enumerate() {
        seed(store, id, MessageStatus::Pending, i64::try_from(i).expect("small")).await;
    }
}

#[tokio::test]
async fn successful_send_marks_sent_and_records_completion() {
    let (_tmp, store) = temp_store().await;
    seed_pending(&store, &["m1"]).await;
    let cache = Arc::new(InMemoryRecordCache::new());
    let sender = Arc::new(ScriptedSender::new());
    let engine = engine(
        store.clone(),
        cache.clone(),
        sender.clone(),
        DeliveryConfig::default(),
    );

    let report = engine.process_batch().await.expect("batch");
    assert_eq!(report.fetched, 1);
    assert_eq!(report.sent, 1);

    let message = store.get("m1").await.expect("get").expect("exists");
    assert_eq!(message.status, MessageStatus::Sent);

    let record = cache.get("m1").expect("record should exist");
    assert_eq!(record.external_response_id.as_deref(), Some("ext-1"));
    assert_eq!(record.recipient, message.recipient);
    assert_eq!(record.content, message.content);
    assert_eq!(
        Some(record.sent_at.timestamp_micros()),
        message.sent_at.map(|at| at.timestamp_micros())
    );
    assert_eq!(sender.calls(), [(message.recipient, message.content)]);
}

#[tokio::test]
async fn one_success_one_failure_in_a_batch_of_two() {
    let (_tmp, store) = temp_store().await;
    let first = seed(&store, "first", MessageStatus::Pending, 0).await;
    let second = seed(&store, "second", MessageStatus::Pending, 1).await;
    let cache = Arc::new(InMemoryRecordCache::new());
    let sender = Arc::new(ScriptedSender::new());
    sender.fail_for(&second.recipient);
    let engine = engine(
        store.clone(),
        cache.clone(),
        sender.clone(),
        DeliveryConfig::default(),
    );

    let report = engine.process_batch().await.expect("batch");
    assert_eq!(report.fetched, 2);
    assert_eq!(report.sent, 1);
    assert_eq!(report.deferred, 1);
    assert_eq!(sender.call_count(), 2);

    assert_eq!(status_of(&store, &first.id).await, MessageStatus::Sent);
    assert!(cache.get(&first.id).is_some());

    assert_eq!(status_of(&store, &second.id).await, MessageStatus::Pending);
    assert!(cache.get(&second.id).is_none());

    // Still eligible for the next tick.
    let pending = store.fetch_pending(10).await.expect("fetch");
    let ids: Vec<&str> = pending.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, ["second"]);
}

#[tokio::test]
async fn batch_limit_bounds_each_batch() {
    let (_tmp, store) = temp_store().await;
    seed_pending(&store, &["a", "b", "c", "d", "e"]).await;
    let cache = Arc::new(InMemoryRecordCache::new());
    let sender = Arc::new(ScriptedSender::new());
    let engine = engine(
        store.clone(),
        cache.clone(),
        sender.clone(),
        DeliveryConfig {
            batch_limit: 2,
            ..DeliveryConfig::default()
        },
    );

    assert_eq!(engine.config().batch_limit, 2);
    let report = engine.process_batch().await.expect("batch");
    assert_eq!(report.fetched, 2);
    assert_eq!(sender.call_count(), 2);
    assert_eq!(status_of(&store, "a").await, MessageStatus::Sent);
    assert_eq!(status_of(&store, "b").await, MessageStatus::Sent);
    assert_eq!(status_of(&store, "c").await, MessageStatus::Pending);

    engine.process_batch().await.expect("batch");
    engine.process_batch().await.expect("batch");
    let last = engine.process_batch().await.expect("batch");
    assert_eq!(last.fetched, 0);
    assert_eq!(sender.call_count(), 5);
    assert_eq!(cache.len(), 5);
}

#[tokio::test]
async fn cache_failure_leaves_message_sending_without_resending() {
    let (_tmp, store) = temp_store().await;
    seed_pending(&store, &["m1"]).await;
    let cache = Arc::new(FaultyCache::new());
    cache.fail_puts(true);
    let sender = Arc::new(ScriptedSender::new());
    let engine = engine(
        store.clone(),
        cache.clone(),
        sender.clone(),
        DeliveryConfig::default(),
    );

    let report = engine.process_batch().await.expect("batch");
    assert_eq!(report.stranded, 1);
    assert_eq!(report.sent, 0);
    assert_eq!(status_of(&store, "m1").await, MessageStatus::Sending);
    assert!(cache.get("m1").is_none());
    assert_eq!(cache.put_attempts(), 1);

    // The next batch does not pick it up again.
    cache.fail_puts(false);
    let next = engine.process_batch().await.expect("batch");
    assert_eq!(next.fetched, 0);
    assert_eq!(sender.call_count(), 1);
}

#[tokio::test]
async fn record_is_never_written_before_claim_commits() {
    let (_tmp, store) = temp_store().await;
    let failing = seed(&store, "fails", MessageStatus::Pending, 0).await;
    seed(&store, "ok-1", MessageStatus::Pending, 1).await;
    seed(&store, "ok-2", MessageStatus::Pending, 2).await;
    let cache = Arc::new(AuditingCache::new(store.clone()));
    let sender = Arc::new(ScriptedSender::new());
    sender.fail_for(&failing.recipient);
    let engine = engine(
        store.clone(),
        cache.clone(),
        sender,
        DeliveryConfig {
            batch_limit: 10,
            ..DeliveryConfig::default()
        },
    );

    engine.process_batch().await.expect("batch");

    assert!(cache.violations().is_empty(), "{:?}", cache.violations());
    assert!(cache.inner.get("ok-1").is_some());
    assert!(cache.inner.get("ok-2").is_some());
    assert!(cache.inner.get("fails").is_none());
}

#[tokio::test]
async fn claim_fault_aborts_batch_with_store_error() {
    let (_tmp, sqlite) = temp_store().await;
    seed_pending(&sqlite, &["m1"]).await;
    let store = Arc::new(FaultyStore::new(sqlite.clone()));
    store.fail_claims(true);
    let sender = Arc::new(ScriptedSender::new());
    let engine = engine(
        store,
        Arc::new(InMemoryRecordCache::new()),
        sender.clone(),
        DeliveryConfig::default(),
    );

    let err = engine.process_batch().await.expect_err("should fail");
    assert!(matches!(err, DeliveryError::Store(_)), "got {err:?}");
    assert_eq!(sender.call_count(), 0);
    assert_eq!(status_of(&sqlite, "m1").await, MessageStatus::Pending);
}

#[tokio::test]
async fn finalize_fault_aborts_batch_and_leaves_message_for_reconciler() {
    let (_tmp, sqlite) = temp_store().await;
    seed_pending(&sqlite, &["m1"]).await;
    let store = Arc::new(FaultyStore::new(sqlite.clone()));
    store.fail_finalizes(true);
    let cache = Arc::new(InMemoryRecordCache::new());
    let sender = Arc::new(ScriptedSender::new());
    let engine = engine(
        store.clone(),
        cache.clone(),
        sender.clone(),
        DeliveryConfig::default(),
    );

    let err = engine.process_batch().await.expect_err("should fail");
    assert!(matches!(err, DeliveryError::Store(_)), "got {err:?}");
    assert_eq!(status_of(&sqlite, "m1").await, MessageStatus::Sending);
    assert!(cache.is_empty());
    assert_eq!(sender.call_count(), 1);

    // The claim committed, so the next batch has nothing to send.
    let report = engine.process_batch().await.expect("batch");
    assert_eq!(report.fetched, 0);
    assert_eq!(sender.call_count(), 1);

    store.fail_finalizes(false);
    let sweep = Reconciler::new(store, cache.clone(), ReconcileConfig::default())
        .reconcile_once()
        .await
        .expect("sweep");
    assert_eq!(sweep.synthesized, 1);
    assert_eq!(status_of(&sqlite, "m1").await, MessageStatus::Sent);
    let record = cache.get("m1").expect("record should exist");
    assert!(record.external_response_id.is_none());
    assert_eq!(sender.call_count(), 1);
}

#[tokio::test]
async fn finalize_lost_to_reconciler_is_counted_not_failed() {
    let (_tmp, sqlite) = temp_store().await;
    seed_pending(&sqlite, &["m1"]).await;
    let store = Arc::new(FaultyStore::new(sqlite.clone()));
    store.preempt_next_finalize();
    let cache = Arc::new(InMemoryRecordCache::new());
    let sender = Arc::new(ScriptedSender::new());
    let engine = engine(store, cache.clone(), sender.clone(), DeliveryConfig::default());

    let report = engine.process_batch().await.expect("batch");
    assert_eq!(report.finalized_elsewhere, 1);
    assert_eq!(report.sent, 0);
    assert_eq!(sender.call_count(), 1);
    assert_eq!(status_of(&sqlite, "m1").await, MessageStatus::Sent);
}

#[tokio::test]
async fn tick_is_a_no_op_while_stopped() {
    let (_tmp, store) = temp_store().await;
    seed_pending(&store, &["m1"]).await;
    let sender = Arc::new(ScriptedSender::new());
    let engine = engine(
        store.clone(),
        Arc::new(InMemoryRecordCache::new()),
        sender.clone(),
        DeliveryConfig::default(),
    );

    assert_eq!(engine.tick().await.expect("tick"), None);
    assert_eq!(sender.call_count(), 0);
    assert_eq!(status_of(&store, "m1").await, MessageStatus::Pending);

    engine.control().start();
    let report = engine.tick().await.expect("tick").expect("should run");
    assert_eq!(report.sent, 1);

    engine.control().stop();
    assert_eq!(engine.tick().await.expect("tick"), None);
}

#[tokio::test]
async fn batch_deadline_rolls_back_in_flight_claim() {
    let (_tmp, store) = temp_store().await;
    seed_pending(&store, &["slow"]).await;
    let sender = Arc::new(ScriptedSender::with_delay(Duration::from_secs(2)));
    let engine = engine(
        store.clone(),
        Arc::new(InMemoryRecordCache::new()),
        sender.clone(),
        DeliveryConfig {
            batch_timeout: Duration::from_millis(100),
            ..DeliveryConfig::default()
        },
    );
    engine.control().start();

    let err = engine.tick().await.expect_err("should hit deadline");
    assert!(matches!(err, DeliveryError::Deadline(_)), "got {err:?}");
    assert_eq!(sender.call_count(), 1);
    assert_eq!(status_of(&store, "slow").await, MessageStatus::Pending);
}

#[tokio::test]
async fn delivers_through_real_webhook() {
    let (_tmp, store) = temp_store().await;
    let message = store
        .enqueue("+905551112233", "Insider - Project")
        .await
        .expect("enqueue");
    let mock = spawn_accepting_webhook().await;
    let cache = Arc::new(InMemoryRecordCache::new());
    let sender = Arc::new(
        WebhookSender::new(mock.url.clone(), Duration::from_secs(5)).expect("sender"),
    );
    let engine = DeliveryEngine::new(
        store.clone(),
        cache.clone(),
        sender,
        Arc::new(DeliveryControl::new()),
        DeliveryConfig::default(),
    );

    let report = engine.process_batch().await.expect("batch");
    assert_eq!(report.sent, 1);
    assert_eq!(mock.hits().len(), 1);

    let record = cache.get(&message.id).expect("record");
    assert_eq!(
        record.external_response_id.as_deref(),
        Some("67f2f8a8-ea58-4ed0-a6f9-ff217df4d849")
    );
    assert_eq!(status_of(&store, &message.id).await, MessageStatus::Sent);
}
