use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::event::PipelineEvent;
use crate::tasks::TaskSet;

/// Broadcast channel for pipeline events.
///
/// Thin wrapper over [`tokio::sync::broadcast`]. Publishing never blocks and
/// never fails: with no subscribers the event is simply dropped, so the core
/// behaves the same whether or not anything is listening.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    /// Capacity is shared across receivers and clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, ev: PipelineEvent) {
        let _ = self.tx.send(ev);
    }

    /// A receiver only observes events sent after it subscribed.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Run `sub` on its own task until `tasks` shuts down.
    ///
    /// Events are delivered in order; a subscriber that falls behind skips the
    /// oldest events and logs how many were lost.
    pub fn spawn_subscriber(&self, tasks: &TaskSet, sub: Arc<dyn Subscribe>) {
        let mut rx = self.subscribe();
        let name = format!("subscriber:{}", sub.name());
        tasks.spawn(name, move |cancel| async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = rx.recv() => match res {
                        Ok(ev) => sub.on_event(&ev).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(subscriber = sub.name(), skipped = n, "event subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }
}

/// Observer plugged into the bus (logging, admin alerts, health probes).
#[async_trait]
pub trait Subscribe: Send + Sync + 'static {
    async fn on_event(&self, event: &PipelineEvent);

    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::UserId;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        topics: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl Subscribe for Recorder {
        async fn on_event(&self, event: &PipelineEvent) {
            self.topics.lock().unwrap().push(event.topic());
        }

        fn name(&self) -> &'static str {
            "recorder"
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(PipelineEvent::CircuitTripped {
            name: "calendar".into(),
            failures: 3,
        });
    }

    #[tokio::test]
    async fn spawned_subscriber_sees_events_in_order() {
        let bus = EventBus::new(16);
        let tasks = TaskSet::new();
        let rec = Arc::new(Recorder::default());
        bus.spawn_subscriber(&tasks, rec.clone());

        bus.publish(PipelineEvent::DuplicateRejected {
            user: UserId(1),
            dedup_key: "k".into(),
        });
        bus.publish(PipelineEvent::CircuitTripped {
            name: "calendar".into(),
            failures: 3,
        });

        for _ in 0..50 {
            if rec.topics.lock().unwrap().len() == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        tasks.shutdown().await;

        assert_eq!(
            *rec.topics.lock().unwrap(),
            vec!["duplicate-rejected", "circuit-tripped"]
        );
    }
}
