//! End-to-end pipeline scenarios: poller → Queue A → summarizer → Queue B →
//! publisher, against an in-memory store, in-process queues, and scripted
//! collaborators.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use mailcast::error::{Error, MailboxError, PublishError, TransformError};
use mailcast::mailbox::{MailMessage, Mailbox, WatchRenewal};
use mailcast::publish::SocialNetwork;
use mailcast::queue::{PublishJob, Queue, SummarizeJob};
use mailcast::stages::{Poller, PublishOutcome, Publisher, SummarizeOutcome, Summarizer};
use mailcast::store::{LibSqlStore, Store, WorkStatus};
use mailcast::transform::PostGenerator;

// ── Scripted collaborators ──────────────────────────────────────────

struct FakeMailbox {
    messages: Vec<MailMessage>,
}

#[async_trait]
impl Mailbox for FakeMailbox {
    async fn list_message_ids(
        &self,
        _newer_than: DateTime<Utc>,
    ) -> Result<Vec<String>, MailboxError> {
        Ok(self.messages.iter().map(|m| m.id.clone()).collect())
    }

    async fn fetch_message(&self, id: &str) -> Result<MailMessage, MailboxError> {
        self.messages
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or_else(|| MailboxError::Decode {
                id: id.to_string(),
                reason: "not found".into(),
            })
    }

    async fn renew_watch(&self) -> Result<WatchRenewal, MailboxError> {
        Ok(WatchRenewal {
            expires_at: Utc::now() + chrono::Duration::days(7),
            history_cursor: None,
        })
    }
}

struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<String, TransformError>>>,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    fn with(results: Vec<Result<String, TransformError>>) -> Self {
        Self {
            script: Mutex::new(results.into()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PostGenerator for ScriptedGenerator {
    async fn generate(&self, _subject: &str, _body: &str) -> Result<String, TransformError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or(Err(TransformError::EmptyOutput))
    }
}

struct ScriptedNetwork {
    script: Mutex<VecDeque<Result<String, PublishError>>>,
    calls: AtomicUsize,
}

impl ScriptedNetwork {
    fn with(results: Vec<Result<String, PublishError>>) -> Self {
        Self {
            script: Mutex::new(results.into()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SocialNetwork for ScriptedNetwork {
    async fn publish(&self, _text: &str) -> Result<String, PublishError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or(Err(PublishError::Http("script exhausted".into())))
    }
}

// ── Harness ─────────────────────────────────────────────────────────

struct Harness {
    store: Arc<LibSqlStore>,
    summarize_queue: Arc<Queue<SummarizeJob>>,
    publish_queue: Arc<Queue<PublishJob>>,
    poller: Poller,
    summarizer: Summarizer,
    publisher: Publisher,
}

async fn harness() -> Harness {
    let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
    let summarize_queue = Queue::new("summarize", Duration::from_secs(30));
    let publish_queue = Queue::new("publish", Duration::from_secs(30));

    let poller = Poller::new(
        store.clone() as Arc<dyn Store>,
        Arc::clone(&summarize_queue),
    );
    let summarizer = Summarizer::new(store.clone() as Arc<dyn Store>, Arc::clone(&publish_queue));
    let publisher = Publisher::new(store.clone() as Arc<dyn Store>);

    Harness {
        store,
        summarize_queue,
        publish_queue,
        poller,
        summarizer,
        publisher,
    }
}

fn inbox_message(id: &str) -> MailMessage {
    MailMessage {
        id: id.to_string(),
        sender: "alice@example.com".to_string(),
        subject: "Weekly update".to_string(),
        body: "We shipped the new release this week.".to_string(),
    }
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn email_flows_to_published_post() {
    let h = harness().await;
    let mailbox = FakeMailbox {
        messages: vec![inbox_message("m1")],
    };

    // Poll: record created at queued, summarize request enqueued.
    let report = h.poller.poll_once(&mailbox).await.unwrap();
    assert_eq!(report.enqueued, 1);

    let item = h.store.get_work_item("m1").await.unwrap().unwrap();
    assert_eq!(item.status, WorkStatus::Queued);

    // Summarize: post generated, publish request enqueued, status advanced.
    let generator = ScriptedGenerator::with(vec![Ok("Hello world".to_string())]);
    let delivery = h.summarize_queue.try_recv().await.unwrap();
    let outcome = h
        .summarizer
        .handle(&generator, &delivery.payload)
        .await
        .unwrap();
    assert_eq!(outcome, SummarizeOutcome::Generated);
    h.summarize_queue.ack(&delivery).await;

    let item = h.store.get_work_item("m1").await.unwrap().unwrap();
    assert_eq!(item.status, WorkStatus::QueuedForPosting);
    assert_eq!(item.generated_text.as_deref(), Some("Hello world"));
    assert!(item.processed_at.is_some());

    // Publish: posted with the external id, terminal.
    let network = ScriptedNetwork::with(vec![Ok("t123".to_string())]);
    let delivery = h.publish_queue.try_recv().await.unwrap();
    assert_eq!(delivery.payload.text, "Hello world");
    let outcome = h
        .publisher
        .handle(&network, &delivery.payload)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        PublishOutcome::Posted {
            published_id: "t123".to_string()
        }
    );
    h.publish_queue.ack(&delivery).await;

    let item = h.store.get_work_item("m1").await.unwrap().unwrap();
    assert_eq!(item.status, WorkStatus::Posted);
    assert_eq!(item.published_id.as_deref(), Some("t123"));
    assert!(item.posted_at.is_some());
}

#[tokio::test]
async fn redelivered_publish_request_is_not_published_twice() {
    let h = harness().await;
    let mailbox = FakeMailbox {
        messages: vec![inbox_message("m1")],
    };
    h.poller.poll_once(&mailbox).await.unwrap();

    let generator = ScriptedGenerator::with(vec![Ok("Hello world".to_string())]);
    let delivery = h.summarize_queue.try_recv().await.unwrap();
    h.summarizer
        .handle(&generator, &delivery.payload)
        .await
        .unwrap();
    h.summarize_queue.ack(&delivery).await;

    // First delivery publishes; it is NOT acked, so the transport
    // redelivers the same message.
    let network = ScriptedNetwork::with(vec![Ok("t123".to_string()), Ok("t999".to_string())]);
    let first = h.publish_queue.try_recv().await.unwrap();
    h.publisher.handle(&network, &first.payload).await.unwrap();
    h.publish_queue.nack(first).await;

    let second = h.publish_queue.try_recv().await.unwrap();
    assert_eq!(second.attempt, 2);
    let outcome = h
        .publisher
        .handle(&network, &second.payload)
        .await
        .unwrap();
    h.publish_queue.ack(&second).await;

    assert_eq!(outcome, PublishOutcome::AlreadyPosted);
    assert_eq!(network.calls.load(Ordering::SeqCst), 1);

    let item = h.store.get_work_item("m1").await.unwrap().unwrap();
    assert_eq!(item.published_id.as_deref(), Some("t123"));
}

#[tokio::test]
async fn rate_limited_publish_is_retried_by_redelivery() {
    let h = harness().await;
    let mailbox = FakeMailbox {
        messages: vec![inbox_message("m1")],
    };
    h.poller.poll_once(&mailbox).await.unwrap();

    let generator = ScriptedGenerator::with(vec![Ok("Hello world".to_string())]);
    let delivery = h.summarize_queue.try_recv().await.unwrap();
    h.summarizer
        .handle(&generator, &delivery.payload)
        .await
        .unwrap();

    let network = ScriptedNetwork::with(vec![
        Err(PublishError::RateLimited),
        Ok("t123".to_string()),
    ]);

    // First attempt: rate limited, re-raised, status unchanged.
    let first = h.publish_queue.try_recv().await.unwrap();
    let err = h
        .publisher
        .handle(&network, &first.payload)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Publish(PublishError::RateLimited)));
    h.publish_queue.nack(first).await;

    let item = h.store.get_work_item("m1").await.unwrap().unwrap();
    assert_eq!(item.status, WorkStatus::QueuedForPosting);

    // Redelivery succeeds.
    let second = h.publish_queue.try_recv().await.unwrap();
    let outcome = h
        .publisher
        .handle(&network, &second.payload)
        .await
        .unwrap();
    assert!(matches!(outcome, PublishOutcome::Posted { .. }));

    let item = h.store.get_work_item("m1").await.unwrap().unwrap();
    assert_eq!(item.status, WorkStatus::Posted);
}

#[tokio::test]
async fn transform_failure_keeps_item_retryable() {
    let h = harness().await;
    let mailbox = FakeMailbox {
        messages: vec![inbox_message("m1")],
    };
    h.poller.poll_once(&mailbox).await.unwrap();

    let generator = ScriptedGenerator::with(vec![
        Err(TransformError::RequestFailed {
            provider: "fake".into(),
            reason: "model unavailable".into(),
        }),
        Ok("Hello world".to_string()),
    ]);

    // First delivery fails mid-transform: no Queue B message, still queued.
    let first = h.summarize_queue.try_recv().await.unwrap();
    let err = h
        .summarizer
        .handle(&generator, &first.payload)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Transform(_)));
    h.summarize_queue.nack(first).await;

    assert!(h.publish_queue.is_empty().await);
    let item = h.store.get_work_item("m1").await.unwrap().unwrap();
    assert_eq!(item.status, WorkStatus::Queued);

    // Redelivery succeeds.
    let second = h.summarize_queue.try_recv().await.unwrap();
    assert_eq!(second.attempt, 2);
    let outcome = h
        .summarizer
        .handle(&generator, &second.payload)
        .await
        .unwrap();
    assert_eq!(outcome, SummarizeOutcome::Generated);
    assert_eq!(h.publish_queue.len().await, 1);
}

#[tokio::test]
async fn repeated_poll_cycles_do_not_duplicate_work() {
    let h = harness().await;
    let mailbox = FakeMailbox {
        messages: vec![inbox_message("m1"), inbox_message("m2")],
    };

    h.poller.poll_once(&mailbox).await.unwrap();
    let report = h.poller.poll_once(&mailbox).await.unwrap();

    assert_eq!(report.found, 2);
    assert_eq!(report.enqueued, 0);
    assert_eq!(report.skipped, 2);
    assert_eq!(h.summarize_queue.len().await, 2);
}

#[tokio::test]
async fn duplicate_summarize_delivery_after_crash_window_is_absorbed() {
    // A summarizer that crashed between its Queue B enqueue and its status
    // write leaves a duplicate publish request on retry; the publisher's
    // pre-check and the terminal conditional write absorb it.
    let h = harness().await;
    let mailbox = FakeMailbox {
        messages: vec![inbox_message("m1")],
    };
    h.poller.poll_once(&mailbox).await.unwrap();

    let generator = ScriptedGenerator::with(vec![
        Ok("Hello world".to_string()),
        Ok("Hello world".to_string()),
    ]);

    // First delivery: enqueue to Queue B happened, then the consumer died
    // before acking — simulate with a nack after a full handle.
    let first = h.summarize_queue.try_recv().await.unwrap();
    h.summarizer
        .handle(&generator, &first.payload)
        .await
        .unwrap();
    h.summarize_queue.nack(first).await;

    // Redelivery: item already queued_for_posting, no second enqueue.
    let second = h.summarize_queue.try_recv().await.unwrap();
    let outcome = h
        .summarizer
        .handle(&generator, &second.payload)
        .await
        .unwrap();
    assert_eq!(outcome, SummarizeOutcome::AlreadyHandled);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.publish_queue.len().await, 1);
}
