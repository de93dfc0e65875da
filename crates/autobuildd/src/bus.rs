//! The event bus.
//!
//! A single broadcast channel carries every [`CoreEvent`]. Each event key
//! (task, terminal, project) has exactly one writer, so per-key ordering
//! falls out of channel FIFO; cross-key ordering is unspecified. Subscribers
//! that lag are told how much they missed.

use autobuild_core::CoreEvent;
use tokio::sync::broadcast;
use tracing::debug;

/// Buffered events per subscriber before lag sets in.
const BUS_CAPACITY: usize = 4096;

/// Cloneable handle to the event stream.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Delivery is best effort: with no subscribers the
    /// event is dropped, which is fine because events are notifications,
    /// not state.
    pub fn publish(&self, event: CoreEvent) {
        debug!(kind = event.kind(), key = %event.key(), "event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autobuild_core::types::Id;

    #[tokio::test]
    async fn subscribers_see_events_in_publish_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        for i in 0..5 {
            bus.publish(CoreEvent::TaskLog {
                task_id: Id::from_string("t1"),
                line: format!("line {i}"),
            });
        }

        for i in 0..5 {
            match rx.recv().await.unwrap() {
                CoreEvent::TaskLog { line, .. } => assert_eq!(line, format!("line {i}")),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(CoreEvent::RoadmapComplete {
            project_id: Id::from_string("p1"),
        });
    }

    #[tokio::test]
    async fn each_subscriber_sees_every_event() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(CoreEvent::TaskError {
            task_id: Id::from_string("t"),
            message: "boom".to_string(),
        });

        assert!(matches!(a.recv().await.unwrap(), CoreEvent::TaskError { .. }));
        assert!(matches!(b.recv().await.unwrap(), CoreEvent::TaskError { .. }));
    }
}
