//! Pipeline stages — poller, summarizer, publisher, subscription renewer.
//!
//! Each stage is a stateless handler invoked by its trigger (timer, queue
//! delivery, cron), plus a `spawn_*` function that wires the handler into a
//! background loop with a shutdown flag.

pub mod poller;
pub mod publisher;
pub mod renewer;
pub mod summarizer;

pub use poller::{PollReport, Poller};
pub use publisher::{PublishOutcome, Publisher};
pub use summarizer::{SummarizeOutcome, Summarizer};
