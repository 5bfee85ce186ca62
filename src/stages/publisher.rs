//! Publisher stage — Queue B consumer, publish call, terminal status write.
//!
//! Three-way error split:
//! - rate limit → re-raised, delivery nacked, status untouched
//! - any other publish failure → `failed` + detail, delivery acked
//! - success → `posted` + external id, terminal
//!
//! A pre-publish status check makes redelivery of an already-posted item a
//! no-op instead of a duplicate publish.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, PublishError};
use crate::publish::{HttpPublisher, PublisherConfig, SocialNetwork};
use crate::queue::{PublishJob, Queue};
use crate::store::{Store, WorkStatus};

/// Outcome of handling one publish request.
#[derive(Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Published and recorded.
    Posted { published_id: String },
    /// Item already posted; no publish call made.
    AlreadyPosted,
    /// Malformed request (empty text); dropped.
    Skipped,
    /// Publish rejected; recorded as failed, not retried automatically.
    Failed,
}

/// Publisher stage.
pub struct Publisher {
    store: Arc<dyn Store>,
}

impl Publisher {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Handle a single delivered publish request.
    pub async fn handle(
        &self,
        network: &dyn SocialNetwork,
        job: &PublishJob,
    ) -> Result<PublishOutcome, Error> {
        if job.text.is_empty() {
            warn!(message_id = %job.message_id, "Publish request has no text, skipping");
            return Ok(PublishOutcome::Skipped);
        }

        // Pre-publish idempotency check: a redelivered request for an item
        // that already reached `posted` must not publish again.
        if let Some(item) = self.store.get_work_item(&job.message_id).await? {
            if item.status == WorkStatus::Posted {
                debug!(message_id = %job.message_id, "Already posted, skipping publish");
                return Ok(PublishOutcome::AlreadyPosted);
            }
        }

        match network.publish(&job.text).await {
            Ok(published_id) => {
                let applied = self.store.mark_posted(&job.message_id, &published_id).await?;
                if !applied {
                    warn!(
                        message_id = %job.message_id,
                        "Posted status already recorded by a concurrent delivery"
                    );
                }
                info!(
                    message_id = %job.message_id,
                    published_id = %published_id,
                    "Post published and recorded"
                );
                Ok(PublishOutcome::Posted { published_id })
            }
            Err(PublishError::RateLimited) => {
                // No state change; the transport redelivers and the item
                // stays at queued_for_posting until then.
                warn!(message_id = %job.message_id, "Rate limited, leaving for redelivery");
                Err(Error::Publish(PublishError::RateLimited))
            }
            Err(e) => {
                let detail = e.to_string();
                self.store.mark_failed(&job.message_id, &detail).await?;
                error!(message_id = %job.message_id, error = %detail, "Publish failed");
                Ok(PublishOutcome::Failed)
            }
        }
    }
}

/// Spawn the Queue B consumer loop. Returns a `JoinHandle` and shutdown flag.
///
/// The publisher client is built fresh for each delivery and dropped after it.
pub fn spawn_publish_loop(
    publisher: Arc<Publisher>,
    config: PublisherConfig,
    queue: Arc<Queue<PublishJob>>,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!("Publisher started");

        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("Publisher shutting down");
                return;
            }

            let Ok(delivery) = tokio::time::timeout(Duration::from_secs(1), queue.recv()).await
            else {
                continue;
            };

            let network = HttpPublisher::new(&config);

            match publisher.handle(&network, &delivery.payload).await {
                Ok(_) => queue.ack(&delivery).await,
                Err(e) => {
                    warn!(
                        message_id = %delivery.payload.message_id,
                        attempt = delivery.attempt,
                        "Publish attempt failed, requeueing: {e}"
                    );
                    queue.nack(delivery).await;
                }
            }
        }
    });

    (handle, shutdown_flag)
}
