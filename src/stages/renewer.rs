//! Subscription renewer stage — keeps the mailbox push watch alive.
//!
//! Independent of the pipeline: no queue, no work-item state, just a
//! cron-scheduled re-registration sharing the mailbox credentials.
//! Re-registering early is safe; it simply resets the expiry window.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{ConfigError, Error};
use crate::mailbox::{GmailMailbox, Mailbox, MailboxConfig, WatchRenewal};

/// Run a single renewal against the given mailbox handle.
pub async fn renew_once(mailbox: &dyn Mailbox) -> Result<WatchRenewal, Error> {
    let renewal = mailbox.renew_watch().await?;
    info!(
        expires_at = %renewal.expires_at,
        history_cursor = ?renewal.history_cursor,
        "Mailbox watch renewed"
    );
    Ok(renewal)
}

/// Parse a renewal cron expression (seconds-resolution, six fields).
pub fn parse_schedule(expr: &str) -> Result<cron::Schedule, ConfigError> {
    cron::Schedule::from_str(expr).map_err(|e| ConfigError::InvalidValue {
        key: "MAILCAST_RENEW_SCHEDULE".to_string(),
        message: format!("invalid cron: {e}"),
    })
}

/// Spawn the renewal ticker. Returns a `JoinHandle` and a shutdown flag.
///
/// Ticks once a minute and fires when the schedule's next occurrence has
/// passed. A failed renewal waits for the next scheduled occurrence; the
/// schedule is expected to fire comfortably before the provider's expiry.
pub fn spawn_renew_loop(
    config: MailboxConfig,
    schedule: cron::Schedule,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        let mut next_fire = schedule.upcoming(Utc).next();
        info!(next = ?next_fire, "Watch renewer started");

        let mut tick = tokio::time::interval(Duration::from_secs(60));
        // Skip immediate first tick
        tick.tick().await;

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Watch renewer shutting down");
                return;
            }

            let Some(due) = next_fire else {
                warn!("Renew schedule has no upcoming occurrence, stopping renewer");
                return;
            };
            if Utc::now() < due {
                continue;
            }

            match GmailMailbox::connect(&config).await {
                Ok(mailbox) => {
                    if let Err(e) = renew_once(&mailbox).await {
                        error!("Watch renewal failed: {e}");
                    }
                }
                Err(e) => error!("Mailbox connect failed: {e}"),
            }

            next_fire = schedule.upcoming(Utc).next();
        }
    });

    (handle, shutdown_flag)
}
