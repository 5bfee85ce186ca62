//! Poller stage — checkpoint-bounded mailbox query → Queue A + work items.
//!
//! Invoked on a timer. Each cycle:
//! 1. Read the poll checkpoint (watermark)
//! 2. List mailbox messages newer than the watermark
//! 3. For each id not already recorded: fetch, enqueue a summarize request,
//!    insert a `queued` work item
//! 4. Advance the checkpoint to now, unconditionally
//!
//! The presence check against the work-item store is the primary dedup
//! gate; it holds for any status, independent of invocation redelivery.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::mailbox::{GmailMailbox, Mailbox, MailboxConfig};
use crate::queue::{Queue, SummarizeJob};
use crate::store::Store;

/// Body excerpt cap applied before transport, bounding queue-message size.
pub const MAX_BODY_CHARS: usize = 1000;

/// Cycle acknowledgment returned to the invoker.
#[derive(Debug, Clone, Copy, Default)]
pub struct PollReport {
    pub found: usize,
    pub enqueued: usize,
    pub skipped: usize,
}

/// Poller stage.
pub struct Poller {
    store: Arc<dyn Store>,
    queue: Arc<Queue<SummarizeJob>>,
}

impl Poller {
    pub fn new(store: Arc<dyn Store>, queue: Arc<Queue<SummarizeJob>>) -> Self {
        Self { store, queue }
    }

    /// Run a single poll cycle against the given mailbox handle.
    pub async fn poll_once(&self, mailbox: &dyn Mailbox) -> Result<PollReport, Error> {
        let since = match self.store.poll_checkpoint().await? {
            Some(watermark) => watermark,
            // First cycle: look back one hour.
            None => Utc::now() - chrono::Duration::hours(1),
        };

        let ids = mailbox.list_message_ids(since).await?;
        let mut report = PollReport {
            found: ids.len(),
            ..Default::default()
        };

        for id in &ids {
            // Primary dedup gate: any recorded status means already handled.
            if self.store.get_work_item(id).await?.is_some() {
                debug!(message_id = %id, "Message already recorded, skipping");
                report.skipped += 1;
                continue;
            }

            match self.ingest(mailbox, id).await {
                Ok(()) => report.enqueued += 1,
                Err(e) => {
                    // Per-candidate failure: log and move on; the cycle continues.
                    warn!(message_id = %id, error = %e, "Failed to ingest message");
                    report.skipped += 1;
                }
            }
        }

        // Advance unconditionally. A message the query window missed is an
        // accepted gap, not something this stage retries.
        self.store.advance_poll_checkpoint(Utc::now()).await?;

        Ok(report)
    }

    async fn ingest(&self, mailbox: &dyn Mailbox, id: &str) -> Result<(), Error> {
        let message = mailbox.fetch_message(id).await?;
        let body = excerpt(&message.body, MAX_BODY_CHARS);

        info!(
            message_id = %message.id,
            sender = %message.sender,
            subject = %message.subject,
            "Ingesting message"
        );

        // Enqueue precedes the record write. A crash between the two leaves a
        // queue message without a record; the summarizer's conditional write
        // creates the record from the payload in that case.
        self.queue
            .send(SummarizeJob {
                message_id: message.id.clone(),
                sender: message.sender.clone(),
                subject: message.subject.clone(),
                body: body.clone(),
            })
            .await;

        self.store
            .insert_queued(&message.id, &message.sender, &message.subject, &body)
            .await?;

        Ok(())
    }
}

/// Character-bounded excerpt of a message body.
fn excerpt(body: &str, max_chars: usize) -> String {
    body.chars().take(max_chars).collect()
}

/// Spawn the poll loop. Returns a `JoinHandle` and a shutdown flag.
///
/// The mailbox capability handle is resolved fresh each cycle and dropped
/// at the end of it.
pub fn spawn_poll_loop(
    poller: Arc<Poller>,
    config: MailboxConfig,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!("Poller started — polling every {}s", interval.as_secs());

        let mut tick = tokio::time::interval(interval);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Poller shutting down");
                return;
            }

            let mailbox = match GmailMailbox::connect(&config).await {
                Ok(mailbox) => mailbox,
                Err(e) => {
                    error!("Mailbox connect failed: {e}");
                    continue;
                }
            };

            match poller.poll_once(&mailbox).await {
                Ok(report) if report.found > 0 => {
                    info!(
                        found = report.found,
                        enqueued = report.enqueued,
                        skipped = report.skipped,
                        "Poll cycle complete"
                    );
                }
                Ok(_) => {}
                Err(e) => error!("Poll cycle failed: {e}"),
            }
        }
    });

    (handle, shutdown_flag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MailboxError;
    use crate::mailbox::{MailMessage, WatchRenewal};
    use crate::store::{LibSqlStore, WorkStatus};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use tokio::sync::Mutex;

    struct FakeMailbox {
        messages: Vec<MailMessage>,
        fail_fetch: Vec<String>,
        last_query: Mutex<Option<DateTime<Utc>>>,
    }

    impl FakeMailbox {
        fn new(messages: Vec<MailMessage>) -> Self {
            Self {
                messages,
                fail_fetch: Vec::new(),
                last_query: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl Mailbox for FakeMailbox {
        async fn list_message_ids(
            &self,
            newer_than: DateTime<Utc>,
        ) -> Result<Vec<String>, MailboxError> {
            *self.last_query.lock().await = Some(newer_than);
            Ok(self.messages.iter().map(|m| m.id.clone()).collect())
        }

        async fn fetch_message(&self, id: &str) -> Result<MailMessage, MailboxError> {
            if self.fail_fetch.iter().any(|f| f == id) {
                return Err(MailboxError::Http("fetch failed".into()));
            }
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
                expires_at: Utc::now(),
                history_cursor: None,
            })
        }
    }

    fn mail(id: &str, body: &str) -> MailMessage {
        MailMessage {
            id: id.to_string(),
            sender: "alice@example.com".to_string(),
            subject: format!("Subject {id}"),
            body: body.to_string(),
        }
    }

    async fn setup() -> (Arc<LibSqlStore>, Arc<Queue<SummarizeJob>>, Poller) {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let queue = Queue::new("summarize", Duration::from_secs(30));
        let poller = Poller::new(store.clone() as Arc<dyn Store>, Arc::clone(&queue));
        (store, queue, poller)
    }

    #[tokio::test]
    async fn ingests_new_messages() {
        let (store, queue, poller) = setup().await;
        let mailbox = FakeMailbox::new(vec![mail("m1", "first"), mail("m2", "second")]);

        let report = poller.poll_once(&mailbox).await.unwrap();
        assert_eq!(report.found, 2);
        assert_eq!(report.enqueued, 2);
        assert_eq!(queue.len().await, 2);

        let item = store.get_work_item("m1").await.unwrap().unwrap();
        assert_eq!(item.status, WorkStatus::Queued);
        assert_eq!(item.body_excerpt, "first");
        assert!(store.poll_checkpoint().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rerun_never_enqueues_known_ids() {
        let (_store, queue, poller) = setup().await;
        let mailbox = FakeMailbox::new(vec![mail("m1", "body")]);

        poller.poll_once(&mailbox).await.unwrap();
        let report = poller.poll_once(&mailbox).await.unwrap();

        assert_eq!(report.enqueued, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn body_excerpt_is_capped() {
        let (store, queue, poller) = setup().await;
        let long_body = "x".repeat(5000);
        let mailbox = FakeMailbox::new(vec![mail("m1", &long_body)]);

        poller.poll_once(&mailbox).await.unwrap();

        let item = store.get_work_item("m1").await.unwrap().unwrap();
        assert_eq!(item.body_excerpt.chars().count(), MAX_BODY_CHARS);

        let delivery = queue.try_recv().await.unwrap();
        assert_eq!(delivery.payload.body.chars().count(), MAX_BODY_CHARS);
    }

    #[tokio::test]
    async fn fetch_failure_skips_item_and_advances_checkpoint() {
        let (store, queue, poller) = setup().await;
        let mut mailbox = FakeMailbox::new(vec![mail("m1", "a"), mail("m2", "b")]);
        mailbox.fail_fetch.push("m1".to_string());

        let report = poller.poll_once(&mailbox).await.unwrap();
        assert_eq!(report.enqueued, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(queue.len().await, 1);

        // The failed candidate left no record; the checkpoint still moved.
        assert!(store.get_work_item("m1").await.unwrap().is_none());
        assert!(store.poll_checkpoint().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn first_cycle_uses_one_hour_lookback() {
        let (_store, _queue, poller) = setup().await;
        let mailbox = FakeMailbox::new(vec![]);

        let before = Utc::now();
        poller.poll_once(&mailbox).await.unwrap();

        let queried = mailbox.last_query.lock().await.unwrap();
        let lookback = before.signed_duration_since(queried);
        assert!(lookback >= chrono::Duration::minutes(59));
        assert!(lookback <= chrono::Duration::minutes(61));
    }

    #[tokio::test]
    async fn later_cycles_use_saved_watermark() {
        let (store, _queue, poller) = setup().await;
        let mailbox = FakeMailbox::new(vec![]);

        let watermark = Utc::now() - chrono::Duration::minutes(5);
        store.advance_poll_checkpoint(watermark).await.unwrap();

        poller.poll_once(&mailbox).await.unwrap();
        let queried = mailbox.last_query.lock().await.unwrap();
        assert_eq!(queried.timestamp(), watermark.timestamp());
    }

    #[test]
    fn excerpt_respects_char_boundaries() {
        assert_eq!(excerpt("こんにちは世界", 5), "こんにちは");
        assert_eq!(excerpt("short", 1000), "short");
    }
}
