//! Summarizer stage — Queue A consumer, text-transform call, Queue B producer.
//!
//! Redelivery-safe: a delivery whose work item is already at
//! `queued_for_posting` or `posted` is acknowledged without a transform call
//! or a new enqueue. The transform call itself is fallible with no partial
//! state — on failure the item stays at `queued` and the delivery is nacked.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::queue::{PublishJob, Queue, SummarizeJob};
use crate::store::{Store, WorkStatus};
use crate::transform::{LlmConfig, PostGenerator, create_generator};

/// Maximum post length in characters.
pub const MAX_POST_CHARS: usize = 280;

/// Marker appended when the generated text exceeds the bound.
const ELLIPSIS: &str = "...";

/// Outcome of handling one summarize request.
#[derive(Debug, PartialEq, Eq)]
pub enum SummarizeOutcome {
    /// Post generated and enqueued for publishing.
    Generated,
    /// Item already past this stage; no transform call, no enqueue.
    AlreadyHandled,
    /// Malformed request (missing identifier); dropped.
    Skipped,
}

/// Summarizer stage.
pub struct Summarizer {
    store: Arc<dyn Store>,
    queue: Arc<Queue<PublishJob>>,
    max_post_chars: usize,
}

impl Summarizer {
    pub fn new(store: Arc<dyn Store>, queue: Arc<Queue<PublishJob>>) -> Self {
        Self {
            store,
            queue,
            max_post_chars: MAX_POST_CHARS,
        }
    }

    /// Handle a single delivered summarize request.
    pub async fn handle(
        &self,
        generator: &dyn PostGenerator,
        job: &SummarizeJob,
    ) -> Result<SummarizeOutcome, Error> {
        if job.message_id.is_empty() {
            warn!("Summarize request missing message id, skipping");
            return Ok(SummarizeOutcome::Skipped);
        }

        // Idempotency gate against duplicate delivery of the same message.
        if let Some(item) = self.store.get_work_item(&job.message_id).await? {
            if matches!(
                item.status,
                WorkStatus::QueuedForPosting | WorkStatus::Posted
            ) {
                debug!(
                    message_id = %job.message_id,
                    status = item.status.as_str(),
                    "Already processed, skipping"
                );
                return Ok(SummarizeOutcome::AlreadyHandled);
            }
        }

        // Transform failure propagates with no state written; the item stays
        // retryable at `queued`.
        let text = generator.generate(&job.subject, &job.body).await?;
        let text = truncate_with_ellipsis(&text, self.max_post_chars);

        // Enqueue precedes the status write. A crash between the two yields a
        // duplicate publish request on retry, absorbed by the publisher's
        // pre-publish check.
        self.queue
            .send(PublishJob {
                message_id: job.message_id.clone(),
                subject: job.subject.clone(),
                text: text.clone(),
            })
            .await;

        let applied = self
            .store
            .mark_generated(&job.message_id, &job.sender, &job.subject, &job.body, &text)
            .await?;
        if !applied {
            debug!(message_id = %job.message_id, "Concurrent delivery recorded generation first");
        }

        info!(
            message_id = %job.message_id,
            chars = text.chars().count(),
            "Post generated and queued for publishing"
        );
        Ok(SummarizeOutcome::Generated)
    }
}

/// Length-bound the generated text: outputs over `max_chars` come back as
/// exactly `max_chars` characters ending in the ellipsis marker.
pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(ELLIPSIS.len());
    let mut truncated: String = text.chars().take(keep).collect();
    truncated.push_str(ELLIPSIS);
    truncated
}

/// Spawn the Queue A consumer loop. Returns a `JoinHandle` and shutdown flag.
///
/// The generator capability is created fresh for each delivery and dropped
/// after it.
pub fn spawn_summarize_loop(
    summarizer: Arc<Summarizer>,
    llm_config: LlmConfig,
    queue: Arc<Queue<SummarizeJob>>,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!("Summarizer started");

        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("Summarizer shutting down");
                return;
            }

            let Ok(delivery) = tokio::time::timeout(Duration::from_secs(1), queue.recv()).await
            else {
                continue;
            };

            let generator = match create_generator(&llm_config) {
                Ok(generator) => generator,
                Err(e) => {
                    error!("Failed to create generator: {e}");
                    queue.nack(delivery).await;
                    continue;
                }
            };

            match summarizer.handle(generator.as_ref(), &delivery.payload).await {
                Ok(_) => queue.ack(&delivery).await,
                Err(e) => {
                    error!(
                        message_id = %delivery.payload.message_id,
                        attempt = delivery.attempt,
                        "Summarize failed: {e}"
                    );
                    queue.nack(delivery).await;
                }
            }
        }
    });

    (handle, shutdown_flag)
}
