//! Per-job progress broadcaster (C8).
//!
//! Grounded on the websocket manager's shape: producers push onto an
//! unbounded queue rather than talking to subscribers directly
//! (`enqueue_broadcast`), and a single background task drains that queue and
//! fans each message out to every current subscriber, best-effort — a
//! subscriber that's gone just has its send fail silently rather than
//! taking down the broadcast loop. Per-job fan-out itself uses
//! `tokio::sync::broadcast`, matching the event bus's publish/subscribe
//! channel idiom.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    StageStarted { job_id: String, stage: String },
    StageCompleted { job_id: String, stage: String, progress_percent: u32 },
    Completed { job_id: String, result: serde_json::Value },
    Failed { job_id: String, error: String },
}

impl ProgressEvent {
    pub fn job_id(&self) -> &str {
        match self {
            Self::StageStarted { job_id, .. }
            | Self::StageCompleted { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. } => job_id,
        }
    }
}

struct Inner {
    channels: Arc<DashMap<String, broadcast::Sender<ProgressEvent>>>,
    queue_tx: mpsc::UnboundedSender<ProgressEvent>,
}

/// Owns the single consumer task that drains queued events and fans them
/// out to per-job broadcast channels. Producers never block on a slow or
/// absent subscriber.
pub struct ProgressBroadcaster {
    inner: Arc<Inner>,
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<ProgressEvent>();
        let channels: Arc<DashMap<String, broadcast::Sender<ProgressEvent>>> = Arc::new(DashMap::new());

        let consumer_channels = channels.clone();
        tokio::spawn(async move {
            while let Some(event) = queue_rx.recv().await {
                if let Some(sender) = consumer_channels.get(event.job_id()) {
                    // A `send` error just means no subscribers are currently
                    // listening; that's not a failure of the broadcast.
                    let _ = sender.send(event);
                }
            }
        });

        Self {
            inner: Arc::new(Inner { channels, queue_tx }),
        }
    }

    /// Registers a job's channel so events can be queued for it before any
    /// subscriber connects.
    pub fn register(&self, job_id: &str) {
        self.inner
            .channels
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
    }

    pub fn subscribe(&self, job_id: &str) -> broadcast::Receiver<ProgressEvent> {
        self.inner
            .channels
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Queues an event for asynchronous delivery. Never blocks the caller.
    pub fn publish(&self, event: ProgressEvent) {
        let _ = self.inner.queue_tx.send(event);
    }

    pub fn unregister(&self, job_id: &str) {
        self.inner.channels.remove(job_id);
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let broadcaster = ProgressBroadcaster::new();
        broadcaster.register("job-1");
        let mut rx = broadcaster.subscribe("job-1");

        broadcaster.publish(ProgressEvent::StageStarted {
            job_id: "job-1".to_string(),
            stage: "lighthouse_mobile".to_string(),
        });

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event arrives before timeout")
            .expect("channel still open");

        assert_eq!(event.job_id(), "job-1");
    }

    #[tokio::test]
    async fn publish_without_subscriber_does_not_block_or_panic() {
        let broadcaster = ProgressBroadcaster::new();
        broadcaster.register("job-1");
        broadcaster.publish(ProgressEvent::Completed {
            job_id: "job-1".to_string(),
            result: serde_json::json!({}),
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn events_for_different_jobs_do_not_cross_over() {
        let broadcaster = ProgressBroadcaster::new();
        broadcaster.register("job-1");
        broadcaster.register("job-2");
        let mut rx1 = broadcaster.subscribe("job-1");
        let mut rx2 = broadcaster.subscribe("job-2");

        broadcaster.publish(ProgressEvent::Failed {
            job_id: "job-1".to_string(),
            error: "boom".to_string(),
        });

        let event = tokio::time::timeout(Duration::from_secs(1), rx1.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.job_id(), "job-1");

        assert!(tokio::time::timeout(Duration::from_millis(50), rx2.recv())
            .await
            .is_err());
    }
}
