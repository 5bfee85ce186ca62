//! libSQL backend — async `Store` trait implementation.
//!
//! Local file and in-memory databases. All timestamps are stored as
//! RFC 3339 text. Status transitions are single conditional UPDATEs so the
//! affected-row count doubles as the "did the transition apply" answer.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::migrations;
use crate::store::traits::{Store, WorkItem, WorkStatus};

/// Singleton checkpoint row name. Owned by the poller.
const POLL_CHECKPOINT: &str = "mailbox_last_poll";

/// Column order shared by every work-item SELECT and `row_to_item`.
const WORK_ITEM_COLUMNS: &str = "message_id, status, sender, subject, body_excerpt, \
     generated_text, published_id, error_detail, queued_at, processed_at, posted_at, updated_at";

/// libSQL store backend.
///
/// Holds a single connection reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("Failed to create database directory: {e}")))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        info!(path = %path.display(), "Store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Map a libsql Row to a WorkItem. Column order matches WORK_ITEM_COLUMNS.
fn row_to_item(row: &libsql::Row) -> Result<WorkItem, libsql::Error> {
    let message_id: String = row.get(0)?;
    let status_str: String = row.get(1)?;
    let sender: String = row.get(2)?;
    let subject: String = row.get(3)?;
    let body_excerpt: String = row.get(4)?;
    let generated_text: Option<String> = row.get(5).ok();
    let published_id: Option<String> = row.get(6).ok();
    let error_detail: Option<String> = row.get(7).ok();
    let queued_str: String = row.get(8)?;
    let processed_str: Option<String> = row.get(9).ok();
    let posted_str: Option<String> = row.get(10).ok();
    let updated_str: String = row.get(11)?;

    Ok(WorkItem {
        message_id,
        status: WorkStatus::from_db(&status_str),
        sender,
        subject,
        body_excerpt,
        generated_text,
        published_id,
        error_detail,
        queued_at: parse_datetime(&queued_str),
        processed_at: parse_optional_datetime(&processed_str),
        posted_at: parse_optional_datetime(&posted_str),
        updated_at: parse_datetime(&updated_str),
    })
}

// ── Store trait ─────────────────────────────────────────────────────

#[async_trait]
impl Store for LibSqlStore {
    async fn run_migrations(&self) -> Result<(), StoreError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn get_work_item(&self, message_id: &str) -> Result<Option<WorkItem>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {WORK_ITEM_COLUMNS} FROM work_items WHERE message_id = ?1"),
                params![message_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_work_item: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let item = row_to_item(&row)
                    .map_err(|e| StoreError::Query(format!("row parse: {e}")))?;
                Ok(Some(item))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_work_item: {e}"))),
        }
    }

    async fn insert_queued(
        &self,
        message_id: &str,
        sender: &str,
        subject: &str,
        body_excerpt: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO work_items (message_id, status, sender, subject, body_excerpt,
                    queued_at, updated_at)
                 VALUES (?1, 'queued', ?2, ?3, ?4, ?5, ?5)",
                params![message_id, sender, subject, body_excerpt, now],
            )
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("UNIQUE") {
                    StoreError::Constraint(format!("work item {message_id} already exists"))
                } else {
                    StoreError::Query(format!("insert_queued: {e}"))
                }
            })?;

        debug!(message_id, "Work item inserted at queued");
        Ok(())
    }

    async fn mark_generated(
        &self,
        message_id: &str,
        sender: &str,
        subject: &str,
        body_excerpt: &str,
        generated_text: &str,
    ) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        // Upsert: the insert arm covers a queue message whose work-item
        // record was lost between the poller's enqueue and its insert.
        let affected = self
            .conn()
            .execute(
                "INSERT INTO work_items (message_id, status, sender, subject, body_excerpt,
                    generated_text, queued_at, processed_at, updated_at)
                 VALUES (?1, 'queued_for_posting', ?2, ?3, ?4, ?5, ?6, ?6, ?6)
                 ON CONFLICT(message_id) DO UPDATE SET
                    status = 'queued_for_posting',
                    generated_text = excluded.generated_text,
                    processed_at = excluded.processed_at,
                    updated_at = excluded.updated_at
                 WHERE work_items.status = 'queued'",
                params![message_id, sender, subject, body_excerpt, generated_text, now],
            )
            .await
            .map_err(|e| StoreError::Query(format!("mark_generated: {e}")))?;

        let applied = affected > 0;
        debug!(message_id, applied, "Generated text recorded");
        Ok(applied)
    }

    async fn mark_posted(
        &self,
        message_id: &str,
        published_id: &str,
    ) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        let affected = self
            .conn()
            .execute(
                "UPDATE work_items
                 SET status = 'posted', published_id = ?2, posted_at = ?3, updated_at = ?3
                 WHERE message_id = ?1 AND status != 'posted'",
                params![message_id, published_id, now],
            )
            .await
            .map_err(|e| StoreError::Query(format!("mark_posted: {e}")))?;

        let applied = affected > 0;
        debug!(message_id, published_id, applied, "Posted recorded");
        Ok(applied)
    }

    async fn mark_failed(
        &self,
        message_id: &str,
        error_detail: &str,
    ) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        let affected = self
            .conn()
            .execute(
                "UPDATE work_items
                 SET status = 'failed', error_detail = ?2, updated_at = ?3
                 WHERE message_id = ?1 AND status != 'posted'",
                params![message_id, error_detail, now],
            )
            .await
            .map_err(|e| StoreError::Query(format!("mark_failed: {e}")))?;

        let applied = affected > 0;
        debug!(message_id, applied, "Failure recorded");
        Ok(applied)
    }

    async fn items_by_status(
        &self,
        status: WorkStatus,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {WORK_ITEM_COLUMNS} FROM work_items
                     WHERE status = ?1 ORDER BY queued_at ASC LIMIT ?2"
                ),
                params![status.as_str(), limit as i64],
            )
            .await
            .map_err(|e| StoreError::Query(format!("items_by_status: {e}")))?;

        let mut items = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_item(&row) {
                Ok(item) => items.push(item),
                Err(e) => {
                    tracing::warn!("Skipping work item row: {e}");
                }
            }
        }
        Ok(items)
    }

    async fn poll_checkpoint(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT watermark FROM checkpoints WHERE name = ?1",
                params![POLL_CHECKPOINT],
            )
            .await
            .map_err(|e| StoreError::Query(format!("poll_checkpoint: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let raw: String = row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("poll_checkpoint: {e}")))?;
                Ok(Some(parse_datetime(&raw)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("poll_checkpoint: {e}"))),
        }
    }

    async fn advance_poll_checkpoint(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO checkpoints (name, watermark, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET
                    watermark = excluded.watermark,
                    updated_at = excluded.updated_at",
                params![POLL_CHECKPOINT, at.to_rfc3339(), now],
            )
            .await
            .map_err(|e| StoreError::Query(format!("advance_poll_checkpoint: {e}")))?;

        debug!(watermark = %at, "Poll checkpoint advanced");
        Ok(())
    }
}
