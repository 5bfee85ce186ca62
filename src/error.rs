//! Error types for mailcast.

/// Top-level error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Durable-store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open database: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Mailbox collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Mailbox request failed: {0}")]
    Http(String),

    #[error("Mailbox authentication failed: {0}")]
    Auth(String),

    #[error("Mailbox returned status {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Failed to decode message {id}: {reason}")]
    Decode { id: String, reason: String },
}

/// Text-transform collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("Transform request to {provider} failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Transform produced empty output")]
    EmptyOutput,
}

/// Publish collaborator errors.
///
/// `RateLimited` is the one non-terminal kind: the Publisher stage re-raises
/// it so the transport redelivers the message, leaving the work item's
/// status untouched. Everything else is a terminal per-item failure.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Publish rate limited")]
    RateLimited,

    #[error("Publish rejected with status {status}: {reason}")]
    Rejected { status: u16, reason: String },

    #[error("Publish request failed: {0}")]
    Http(String),

    #[error("Invalid publish response: {0}")]
    InvalidResponse(String),
}

impl PublishError {
    /// True for the rate-limit kind, which must not mark the item `failed`.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited)
    }
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;
