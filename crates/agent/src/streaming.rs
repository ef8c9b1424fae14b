//! Write-through of partial assistant output for interactive channels.
//!
//! The throttle decides which accumulated snapshots are worth persisting; the
//! writer persists them from a single background task, always writing the
//! newest snapshot and dropping any it was too slow to write.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

use zenthor_core::domain::message::MessageId;
use zenthor_db::repositories::MessageStore;

/// Admits at most one write per `interval`. The first write is always admitted.
#[derive(Clone, Debug)]
pub struct StreamThrottle {
    interval: Duration,
    last_admitted: Option<Instant>,
}

impl StreamThrottle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last_admitted: None }
    }

    pub fn admit(&mut self, now: Instant) -> bool {
        let due = match self.last_admitted {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        };
        if due {
            self.last_admitted = Some(now);
        }
        due
    }
}

/// Coalescing background writer for one streaming placeholder message.
pub struct StreamWriter {
    latest: watch::Sender<Option<String>>,
    task: JoinHandle<()>,
}

impl StreamWriter {
    pub fn spawn(messages: Arc<dyn MessageStore>, message_id: MessageId) -> Self {
        let (latest, mut receiver) = watch::channel(None::<String>);
        let task = tokio::spawn(async move {
            // ends once the sender is dropped and the last snapshot was seen
            while receiver.changed().await.is_ok() {
                let snapshot = receiver.borrow_and_update().clone();
                let Some(content) = snapshot else {
                    continue;
                };
                if let Err(error) = messages.update_streaming_content(&message_id, &content).await {
                    warn!(
                        event_name = "agent.stream.write_failed",
                        message_id = %message_id.0,
                        error = %error,
                        "streaming write dropped"
                    );
                }
            }
        });
        Self { latest, task }
    }

    /// Replaces the pending snapshot; never waits on storage.
    pub fn push(&self, content: String) {
        self.latest.send_replace(Some(content));
    }

    /// Waits until the newest pushed snapshot has been written.
    pub async fn drain(self) {
        drop(self.latest);
        if let Err(error) = self.task.await {
            warn!(event_name = "agent.stream.writer_aborted", error = %error, "stream writer task ended abnormally");
        }
    }
}
