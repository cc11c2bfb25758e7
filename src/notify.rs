//! Commit notifications: single events for a trickle, one aggregated event
//! for a burst.
//!
//! The orchestrator records commits into an unbounded channel; a background
//! task windows them and delivers through an injected [`NotificationSink`],
//! so tests substitute a recording sink and never touch the network.

use crate::types::UploadMode;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A successfully committed upload.
#[derive(Debug, Clone, Serialize)]
pub struct CommitEvent {
    pub object_name: String,
    pub original_filename: String,
    pub size: u64,
    pub content_hash: String,
    pub mode: UploadMode,
    pub committed_at: DateTime<Utc>,
}

/// Delivery capability for commit events.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify_single(&self, event: &CommitEvent);
    async fn notify_batch(&self, events: &[CommitEvent]);
}

/// Sink used when no webhook is configured.
pub struct NullSink;

#[async_trait]
impl NotificationSink for NullSink {
    async fn notify_single(&self, _event: &CommitEvent) {}
    async fn notify_batch(&self, _events: &[CommitEvent]) {}
}

/// Posts JSON payloads to a configured webhook URL.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }

    async fn post(&self, payload: &serde_json::Value) {
        match self.client.post(&self.url).json(payload).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(status = %resp.status(), "notification webhook rejected payload"),
            Err(err) => warn!(error = %err, "notification webhook unreachable"),
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn notify_single(&self, event: &CommitEvent) {
        self.post(&serde_json::json!({
            "type": "upload.committed",
            "event": event,
        }))
        .await;
    }

    async fn notify_batch(&self, events: &[CommitEvent]) {
        self.post(&serde_json::json!({
            "type": "upload.batch",
            "count": events.len(),
            "events": events,
        }))
        .await;
    }
}

/// Handle the orchestrator records commits through. Cheap to clone.
#[derive(Clone)]
pub struct CommitNotifier {
    tx: mpsc::UnboundedSender<CommitEvent>,
}

impl CommitNotifier {
    /// Spawn the windowing task. Commits landing within `window` of each
    /// other are collected; a batch of `threshold` or more goes out as one
    /// aggregated event, smaller batches as individual events.
    pub fn spawn(sink: Arc<dyn NotificationSink>, threshold: usize, window: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_batcher(sink, rx, threshold, window));
        Self { tx }
    }

    pub fn record_commit(&self, event: CommitEvent) {
        // Receiver only drops at shutdown; losing a notification then is fine.
        let _ = self.tx.send(event);
    }
}

async fn run_batcher(
    sink: Arc<dyn NotificationSink>,
    mut rx: mpsc::UnboundedReceiver<CommitEvent>,
    threshold: usize,
    window: Duration,
) {
    loop {
        let Some(first) = rx.recv().await else { break };
        let mut batch = vec![first];
        let mut closed = false;

        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = rx.recv() => match event {
                    Some(event) => batch.push(event),
                    None => {
                        closed = true;
                        break;
                    }
                },
            }
        }

        debug!(count = batch.len(), "flushing commit notifications");
        if threshold > 0 && batch.len() >= threshold {
            sink.notify_batch(&batch).await;
        } else {
            for event in &batch {
                sink.notify_single(event).await;
            }
        }

        if closed {
            break;
        }
    }
}
