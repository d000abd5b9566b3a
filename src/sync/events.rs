//! Event publishing side-channel: the logger emits `event` notifications
//! during a synchronization run, and this queue serializes their
//! transmission to the remote service without blocking the upload path.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct SyncEvent {
    pub name: String,
    pub description: String,
}

/// A background-drained queue of events. Cloning an `EventPublisher`
/// shares the same underlying channel, so every step/upload task can hold
/// its own handle.
#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::UnboundedSender<SyncEvent>,
}

pub struct EventPublisherHandle {
    join: JoinHandle<()>,
}

impl EventPublisher {
    /// Spawns the background drain task. The publisher sends events; the
    /// returned handle is awaited (via `shutdown`) once the caller wants
    /// to guarantee the queue is idle.
    pub fn spawn<F, Fut>(sink: F) -> (Self, EventPublisherHandle)
    where
        F: Fn(SyncEvent) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<SyncEvent>();
        let join = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                sink(event).await;
            }
        });
        (EventPublisher { tx }, EventPublisherHandle { join })
    }

    pub fn publish(&self, name: impl Into<String>, description: impl Into<String>) {
        let event = SyncEvent {
            name: name.into(),
            description: description.into(),
        };
        if self.tx.send(event).is_err() {
            warn!("event publisher channel closed; dropping event");
        }
    }
}

impl EventPublisherHandle {
    /// Closes the channel (by dropping the last sender elsewhere) and
    /// awaits the drain task to idle. Callers must drop every
    /// `EventPublisher` clone before calling this or it will hang.
    pub async fn shutdown(self) {
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn drains_all_published_events_before_idle() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let (publisher, handle) = EventPublisher::spawn(move |_event| {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        for i in 0..5 {
            publisher.publish(format!("event-{i}"), "test");
        }
        drop(publisher);
        handle.shutdown().await;

        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }
}
