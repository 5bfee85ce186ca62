//! Top-level configuration, built from environment variables.

use crate::error::ConfigError;
use crate::mailbox::MailboxConfig;
use crate::publish::PublisherConfig;
use crate::transform::LlmConfig;

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the local state database.
    pub db_path: String,
    /// Poller trigger interval in seconds.
    pub poll_interval_secs: u64,
    /// Cron expression for watch renewal (six fields, seconds first).
    pub renew_schedule: String,
    /// Queue visibility timeout before an unacked delivery comes back.
    pub queue_visibility_secs: u64,
    pub mailbox: MailboxConfig,
    pub llm: LlmConfig,
    pub publisher: PublisherConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path = std::env::var("MAILCAST_DB_PATH")
            .unwrap_or_else(|_| "./data/mailcast.db".to_string());

        let poll_interval_secs = env_u64("MAILCAST_POLL_INTERVAL_SECS", 300);

        // Default: 03:00 on every sixth day of the month, comfortably inside
        // the provider's seven-day watch expiry.
        let renew_schedule = std::env::var("MAILCAST_RENEW_SCHEDULE")
            .unwrap_or_else(|_| "0 0 3 */6 * *".to_string());

        let queue_visibility_secs = env_u64("MAILCAST_QUEUE_VISIBILITY_SECS", 120);

        Ok(Self {
            db_path,
            poll_interval_secs,
            renew_schedule,
            queue_visibility_secs,
            mailbox: MailboxConfig::from_env()?,
            llm: LlmConfig::from_env()?,
            publisher: PublisherConfig::from_env()?,
        })
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
