use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use mailcast::config::Config;
use mailcast::queue::{PublishJob, Queue, SummarizeJob};
use mailcast::stages::poller::{self, Poller};
use mailcast::stages::publisher::{self, Publisher};
use mailcast::stages::renewer;
use mailcast::stages::summarizer::{self, Summarizer};
use mailcast::store::{LibSqlStore, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    eprintln!("📮 mailcast v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.llm.model);
    eprintln!("   Database: {}", config.db_path);
    eprintln!("   Poll interval: {}s", config.poll_interval_secs);

    // ── Store ───────────────────────────────────────────────────────────
    let db_path = std::path::Path::new(&config.db_path);
    let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_local(db_path).await.unwrap_or_else(|e| {
        eprintln!("Error: Failed to open database at {}: {}", config.db_path, e);
        std::process::exit(1);
    }));

    // ── Queues ──────────────────────────────────────────────────────────
    let visibility = Duration::from_secs(config.queue_visibility_secs);
    let summarize_queue = Queue::<SummarizeJob>::new("summarize", visibility);
    let publish_queue = Queue::<PublishJob>::new("publish", visibility);

    // ── Stages ──────────────────────────────────────────────────────────
    let poller = Arc::new(Poller::new(Arc::clone(&store), Arc::clone(&summarize_queue)));
    let summarizer = Arc::new(Summarizer::new(
        Arc::clone(&store),
        Arc::clone(&publish_queue),
    ));
    let publisher = Arc::new(Publisher::new(Arc::clone(&store)));

    let (poll_handle, poll_shutdown) = poller::spawn_poll_loop(
        poller,
        config.mailbox.clone(),
        Duration::from_secs(config.poll_interval_secs),
    );
    let (summarize_handle, summarize_shutdown) = summarizer::spawn_summarize_loop(
        summarizer,
        config.llm.clone(),
        Arc::clone(&summarize_queue),
    );
    let (publish_handle, publish_shutdown) = publisher::spawn_publish_loop(
        publisher,
        config.publisher.clone(),
        Arc::clone(&publish_queue),
    );

    // Conditionally spawn the watch renewer if a topic is configured
    let renew_loop = if config.mailbox.watch_topic.is_some() {
        let schedule = renewer::parse_schedule(&config.renew_schedule)?;
        eprintln!("   Watch renewal: {}", config.renew_schedule);
        Some(renewer::spawn_renew_loop(config.mailbox.clone(), schedule))
    } else {
        eprintln!("   Watch renewal: disabled (no topic configured)");
        None
    };

    eprintln!("   Pipeline running. Ctrl-C to stop.\n");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    poll_shutdown.store(true, Ordering::Relaxed);
    summarize_shutdown.store(true, Ordering::Relaxed);
    publish_shutdown.store(true, Ordering::Relaxed);
    if let Some((_, shutdown)) = &renew_loop {
        shutdown.store(true, Ordering::Relaxed);
    }

    // Give the loops a moment to notice the flags, then exit regardless.
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = poll_handle.await;
        let _ = summarize_handle.await;
        let _ = publish_handle.await;
        if let Some((handle, _)) = renew_loop {
            let _ = handle.await;
        }
    })
    .await;

    Ok(())
}
