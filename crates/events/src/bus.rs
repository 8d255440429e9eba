//! Event bus implementation using tokio broadcast channels

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use uuid::Uuid;

use crate::types::{Event, EventEnvelope};

/// Capacity for the broadcast channel
const DEFAULT_CAPACITY: usize = 1000;

/// Event bus for publishing and subscribing to events.
///
/// Every published envelope is stamped with a sequence number that is
/// strictly increasing across all clones of the bus.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new event bus with specified capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an envelope to all subscribers.
    ///
    /// Returns the number of subscribers that received the event; with no
    /// subscribers the event is dropped and 0 is returned.
    pub fn publish(&self, envelope: EventEnvelope) -> usize {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.sender.send(envelope.with_sequence(seq)).unwrap_or(0)
    }

    /// Wrap `event` in a fresh envelope and publish it.
    pub fn emit(&self, event: Event) -> usize {
        self.publish(EventEnvelope::new(event))
    }

    /// Subscribe to all events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Subscribe to the events of a single task.
    pub fn subscribe_task(&self, task_id: Uuid) -> TaskEvents {
        TaskEvents {
            task_id,
            receiver: self.sender.subscribe(),
            missed: 0,
        }
    }

    /// Get the number of current subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Get the total number of events published
    pub fn event_count(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .field("event_count", &self.event_count())
            .finish()
    }
}

/// Receiver filtered to one task.
pub struct TaskEvents {
    task_id: Uuid,
    receiver: broadcast::Receiver<EventEnvelope>,
    missed: u64,
}

impl TaskEvents {
    /// Next event for the task, or `None` once the bus is gone.
    ///
    /// A slow subscriber skips events it lagged behind on; the number
    /// skipped is available from [`TaskEvents::missed`].
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) if envelope.event.task_id() == Some(self.task_id) => {
                    return Some(envelope)
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => self.missed += skipped,
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next event already queued for the task, without waiting.
    pub fn try_next(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.receiver.try_recv() {
                Ok(envelope) if envelope.event.task_id() == Some(self.task_id) => {
                    return Some(envelope)
                }
                Ok(_) => continue,
                Err(TryRecvError::Lagged(skipped)) => self.missed += skipped,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    pub fn missed(&self) -> u64 {
        self.missed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(task_id: Uuid) -> Event {
        Event::RunStarted {
            task_id,
            workflow_id: "bugfix-fast-flow".to_string(),
            step_id: "plan".to_string(),
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let envelope = EventEnvelope::new(started(Uuid::new_v4()));

        let sent = bus.publish(envelope.clone());
        assert_eq!(sent, 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, envelope.id);
        assert_eq!(received.sequence, Some(1));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let envelope = EventEnvelope::new(started(Uuid::new_v4()));
        let envelope_id = envelope.id;

        let sent = bus.publish(envelope);
        assert_eq!(sent, 2);

        let received1 = rx1.recv().await.unwrap();
        let received2 = rx2.recv().await.unwrap();

        assert_eq!(received1.id, envelope_id);
        assert_eq!(received2.id, envelope_id);
    }

    #[tokio::test]
    async fn test_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.emit(started(Uuid::new_v4())), 0);
        assert_eq!(bus.event_count(), 1);
    }

    #[tokio::test]
    async fn test_sequence_shared_between_clones() {
        let bus1 = EventBus::new();
        let bus2 = bus1.clone();
        let mut rx = bus1.subscribe();

        bus1.emit(started(Uuid::new_v4()));
        bus2.emit(started(Uuid::new_v4()));
        bus1.emit(started(Uuid::new_v4()));

        let mut sequences = Vec::new();
        for _ in 0..3 {
            sequences.push(rx.recv().await.unwrap().sequence.unwrap());
        }
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(bus2.event_count(), 3);
    }

    #[tokio::test]
    async fn test_task_subscription_filters() {
        let bus = EventBus::new();
        let watched = Uuid::new_v4();
        let mut events = bus.subscribe_task(watched);

        bus.emit(started(Uuid::new_v4()));
        bus.emit(Event::Error {
            message: "unrelated".to_string(),
            context: None,
        });
        bus.emit(Event::RunResumed {
            task_id: watched,
            step_id: "review".to_string(),
        });

        let next = events.next().await.unwrap();
        assert!(matches!(next.event, Event::RunResumed { .. }));
        assert_eq!(next.sequence, Some(3));
        assert_eq!(events.missed(), 0);
    }

    #[test]
    fn test_try_next_drains_queued_events() {
        let bus = EventBus::new();
        let watched = Uuid::new_v4();
        let mut events = bus.subscribe_task(watched);
        assert!(events.try_next().is_none());

        bus.emit(started(watched));
        bus.emit(started(Uuid::new_v4()));
        bus.emit(Event::RunCancelled {
            task_id: watched,
            step_id: "plan".to_string(),
        });

        assert!(matches!(events.try_next().unwrap().event, Event::RunStarted { .. }));
        assert!(matches!(events.try_next().unwrap().event, Event::RunCancelled { .. }));
        assert!(events.try_next().is_none());
    }

    #[tokio::test]
    async fn test_task_subscription_ends_with_bus() {
        let bus = EventBus::new();
        let mut events = bus.subscribe_task(Uuid::new_v4());
        drop(bus);
        assert!(events.next().await.is_none());
    }

    #[test]
    fn test_subscriber_count() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);

        let _rx1 = bus.subscribe();
        let _rx2 = bus.clone().subscribe_task(Uuid::new_v4());
        assert_eq!(bus.subscriber_count(), 2);
    }
}
