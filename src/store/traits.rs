//! `Store` trait — single async interface for the shared durable state.
//!
//! Two logical tables: work items keyed by the provider-assigned message
//! identifier, and a singleton poll checkpoint. Status transitions are
//! conditional writes: each `mark_*` method applies only when the current
//! status is an expected prior value and reports whether it applied, which
//! is what makes redelivered queue messages safe to reprocess.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;

/// Lifecycle status of a work item.
///
/// Forward-only: `Queued` → `QueuedForPosting` → `Posted` | `Failed`.
/// A `Failed` item may still reach `Posted` via a retried delivery, but
/// never moves back to an earlier status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    /// Ingested by the poller, summarize request enqueued.
    Queued,
    /// Post text generated, publish request enqueued.
    QueuedForPosting,
    /// Published; terminal.
    Posted,
    /// Publish rejected; terminal until a redelivery retries it.
    Failed,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::QueuedForPosting => "queued_for_posting",
            Self::Posted => "posted",
            Self::Failed => "failed",
        }
    }

    /// Parse a status string from the DB. Unknown values fall back to `Queued`.
    pub fn from_db(s: &str) -> Self {
        match s {
            "queued_for_posting" => Self::QueuedForPosting,
            "posted" => Self::Posted,
            "failed" => Self::Failed,
            _ => Self::Queued,
        }
    }
}

/// A tracked unit of work, keyed by the provider's message identifier.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub message_id: String,
    pub status: WorkStatus,
    pub sender: String,
    pub subject: String,
    pub body_excerpt: String,
    pub generated_text: Option<String>,
    pub published_id: Option<String>,
    pub error_detail: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub posted_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Backend-agnostic store trait covering work items and the poll checkpoint.
#[async_trait]
pub trait Store: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), StoreError>;

    // ── Work items ──────────────────────────────────────────────────

    /// Look up a work item by message id.
    async fn get_work_item(&self, message_id: &str) -> Result<Option<WorkItem>, StoreError>;

    /// Create a work item at status `queued`. Fails on duplicate id.
    async fn insert_queued(
        &self,
        message_id: &str,
        sender: &str,
        subject: &str,
        body_excerpt: &str,
    ) -> Result<(), StoreError>;

    /// Record a generated post: `queued` → `queued_for_posting`.
    ///
    /// Creates the record if the poller's write was lost after its enqueue
    /// (the queue payload carries the captured fields for exactly this case).
    /// Returns false when the transition did not apply — the item was already
    /// past `queued`.
    async fn mark_generated(
        &self,
        message_id: &str,
        sender: &str,
        subject: &str,
        body_excerpt: &str,
        generated_text: &str,
    ) -> Result<bool, StoreError>;

    /// Record a successful publish: any non-`posted` status → `posted`.
    ///
    /// Terminal and idempotent; returns false if the item was already
    /// `posted` or does not exist.
    async fn mark_posted(
        &self,
        message_id: &str,
        published_id: &str,
    ) -> Result<bool, StoreError>;

    /// Record a terminal publish failure with detail.
    ///
    /// Never overwrites `posted`; returns false if it did not apply.
    async fn mark_failed(
        &self,
        message_id: &str,
        error_detail: &str,
    ) -> Result<bool, StoreError>;

    /// List work items at a given status, oldest first.
    async fn items_by_status(
        &self,
        status: WorkStatus,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError>;

    // ── Poll checkpoint ─────────────────────────────────────────────

    /// Read the poll watermark. `None` before the first completed cycle.
    async fn poll_checkpoint(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Advance the poll watermark. Owned exclusively by the poller.
    async fn advance_poll_checkpoint(&self, at: DateTime<Utc>) -> Result<(), StoreError>;
}
