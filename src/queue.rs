//! In-process queue transport with at-least-once delivery semantics.
//!
//! Models the delivery channel the pipeline stages are written against:
//! no ordering guarantee, per-message visibility timeout, redelivery on
//! negative acknowledgment or timeout. A delivery that is never acked comes
//! back; consumers must therefore be idempotent (the stages guarantee this
//! through the store's conditional status writes).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

// ── Payloads ────────────────────────────────────────────────────────

/// Queue A message: a summarize request produced by the poller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizeJob {
    pub message_id: String,
    pub sender: String,
    pub subject: String,
    /// Body excerpt, capped at ingestion to bound message size.
    pub body: String,
}

/// Queue B message: a publish request produced by the summarizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishJob {
    pub message_id: String,
    /// Original subject, for traceability in logs.
    pub subject: String,
    /// The generated post text.
    pub text: String,
}

// ── Transport ───────────────────────────────────────────────────────

/// A single delivered message. Holds the payload plus the receipt needed
/// to ack or nack it.
#[derive(Debug)]
pub struct Delivery<T> {
    pub payload: T,
    pub receipt: Uuid,
    /// 1 on first delivery, incremented on each redelivery.
    pub attempt: u32,
}

struct Envelope<T> {
    receipt: Uuid,
    attempts: u32,
    payload: T,
}

struct State<T> {
    ready: VecDeque<Envelope<T>>,
    in_flight: HashMap<Uuid, (Instant, Envelope<T>)>,
}

/// At-least-once queue. Cheap to share via `Arc`.
pub struct Queue<T> {
    name: &'static str,
    visibility: Duration,
    state: Mutex<State<T>>,
    notify: Notify,
}

impl<T: Clone + Send> Queue<T> {
    pub fn new(name: &'static str, visibility: Duration) -> Arc<Self> {
        Arc::new(Self {
            name,
            visibility,
            state: Mutex::new(State {
                ready: VecDeque::new(),
                in_flight: HashMap::new(),
            }),
            notify: Notify::new(),
        })
    }

    /// Enqueue a payload for delivery.
    pub async fn send(&self, payload: T) {
        let mut state = self.state.lock().await;
        state.ready.push_back(Envelope {
            receipt: Uuid::new_v4(),
            attempts: 0,
            payload,
        });
        drop(state);
        self.notify.notify_one();
    }

    /// Receive the next delivery, waiting if none is ready.
    ///
    /// In-flight messages whose visibility window has lapsed are returned
    /// to the ready queue first, so an unacked delivery always comes back.
    pub async fn recv(&self) -> Delivery<T> {
        loop {
            let next_deadline;
            {
                let mut state = self.state.lock().await;
                Self::requeue_expired(&mut state);

                if let Some(mut env) = state.ready.pop_front() {
                    env.attempts += 1;
                    let delivery = Delivery {
                        payload: env.payload.clone(),
                        receipt: env.receipt,
                        attempt: env.attempts,
                    };
                    let deadline = Instant::now() + self.visibility;
                    state.in_flight.insert(env.receipt, (deadline, env));
                    return delivery;
                }

                next_deadline = state.in_flight.values().map(|(d, _)| *d).min();
            }

            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Receive without waiting. Returns `None` when nothing is ready.
    pub async fn try_recv(&self) -> Option<Delivery<T>> {
        let mut state = self.state.lock().await;
        Self::requeue_expired(&mut state);

        let mut env = state.ready.pop_front()?;
        env.attempts += 1;
        let delivery = Delivery {
            payload: env.payload.clone(),
            receipt: env.receipt,
            attempt: env.attempts,
        };
        let deadline = Instant::now() + self.visibility;
        state.in_flight.insert(env.receipt, (deadline, env));
        Some(delivery)
    }

    /// Acknowledge a delivery, removing the message for good.
    ///
    /// Acking after the visibility window lapsed is a no-op — the message
    /// goes back to the ready queue and will be delivered again.
    pub async fn ack(&self, delivery: &Delivery<T>) {
        let mut state = self.state.lock().await;
        Self::requeue_expired(&mut state);
        if state.in_flight.remove(&delivery.receipt).is_none() {
            debug!(queue = self.name, receipt = %delivery.receipt, "Late ack ignored");
        }
    }

    /// Negatively acknowledge a delivery, requeueing it immediately.
    pub async fn nack(&self, delivery: Delivery<T>) {
        let mut state = self.state.lock().await;
        if let Some((_, env)) = state.in_flight.remove(&delivery.receipt) {
            debug!(queue = self.name, attempt = env.attempts, "Delivery nacked, requeued");
            state.ready.push_back(env);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Number of messages ready for delivery (excludes in-flight).
    pub async fn len(&self) -> usize {
        let mut state = self.state.lock().await;
        Self::requeue_expired(&mut state);
        state.ready.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn requeue_expired(state: &mut State<T>) {
        let now = Instant::now();
        let expired: Vec<Uuid> = state
            .in_flight
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(receipt, _)| *receipt)
            .collect();
        for receipt in expired {
            if let Some((_, env)) = state.in_flight.remove(&receipt) {
                state.ready.push_back(env);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<Queue<SummarizeJob>> {
        Queue::new("test", Duration::from_secs(30))
    }

    fn job(id: &str) -> SummarizeJob {
        SummarizeJob {
            message_id: id.into(),
            sender: "alice@example.com".into(),
            subject: "subject".into(),
            body: "body".into(),
        }
    }

    #[tokio::test]
    async fn send_recv_ack() {
        let q = queue();
        q.send(job("m1")).await;

        let delivery = q.recv().await;
        assert_eq!(delivery.payload.message_id, "m1");
        assert_eq!(delivery.attempt, 1);

        q.ack(&delivery).await;
        assert!(q.try_recv().await.is_none());
    }

    #[tokio::test]
    async fn nack_redelivers_with_higher_attempt() {
        let q = queue();
        q.send(job("m1")).await;

        let first = q.recv().await;
        assert_eq!(first.attempt, 1);
        q.nack(first).await;

        let second = q.recv().await;
        assert_eq!(second.payload.message_id, "m1");
        assert_eq!(second.attempt, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_delivery_comes_back_after_visibility_timeout() {
        let q: Arc<Queue<SummarizeJob>> = Queue::new("test", Duration::from_millis(100));
        q.send(job("m1")).await;

        let first = q.recv().await;
        assert_eq!(first.attempt, 1);
        // No ack — consumer "crashed".

        let second = q.recv().await;
        assert_eq!(second.payload.message_id, "m1");
        assert_eq!(second.attempt, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn late_ack_does_not_remove_requeued_message() {
        let q: Arc<Queue<SummarizeJob>> = Queue::new("test", Duration::from_millis(100));
        q.send(job("m1")).await;

        let first = q.recv().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Visibility lapsed; ack arrives too late.
        q.ack(&first).await;

        let second = q.try_recv().await.expect("message redelivered");
        assert_eq!(second.attempt, 2);
    }

    #[tokio::test]
    async fn recv_waits_for_send() {
        let q = queue();
        let q2 = Arc::clone(&q);

        let recv_task = tokio::spawn(async move { q2.recv().await });
        tokio::task::yield_now().await;

        q.send(job("m1")).await;
        let delivery = recv_task.await.unwrap();
        assert_eq!(delivery.payload.message_id, "m1");
    }

    #[tokio::test]
    async fn payloads_roundtrip_as_json() {
        let job = PublishJob {
            message_id: "m1".into(),
            subject: "Hello".into(),
            text: "こんにちは".into(),
        };
        let json = serde_json::to_string(&job).unwrap();
        let back: PublishJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back.message_id, "m1");
        assert_eq!(back.text, "こんにちは");
    }
}
