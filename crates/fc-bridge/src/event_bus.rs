use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;

use crate::protocol::{MonitorEnvelope, MonitorEvent};

/// Per-subscriber buffer capacity before back-pressure kicks in.
pub const SUBSCRIBER_CAPACITY: usize = 512;

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

struct SubscriberInner {
    queue: Mutex<VecDeque<MonitorEnvelope>>,
    notify: Notify,
    capacity: usize,
}

/// A broadcast bus with explicit per-subscriber back-pressure.
///
/// Each subscriber owns a bounded queue. When a queue is full, the oldest
/// non-critical event is dropped to make room; critical events (errors,
/// session-end) are never dropped. Cheap to clone; per-source ordering is
/// preserved because publishing appends under one lock per subscriber.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Weak<SubscriberInner>>>>,
}

/// The receiving end returned by [`EventBus::subscribe`].
pub struct EventSubscriber {
    inner: Arc<SubscriberInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a subscriber receiving everything published from now on.
    pub fn subscribe(&self) -> EventSubscriber {
        self.subscribe_with_capacity(SUBSCRIBER_CAPACITY)
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> EventSubscriber {
        let inner = Arc::new(SubscriberInner {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        });
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .push(Arc::downgrade(&inner));
        EventSubscriber { inner }
    }

    /// Publish an event to all live subscribers. Dead subscribers (whose
    /// receivers were dropped) are pruned in passing.
    pub fn publish(&self, event: MonitorEvent) {
        let envelope = event.envelope();
        let mut subscribers = self.subscribers.lock().expect("event bus lock poisoned");
        subscribers.retain(|weak| {
            let Some(sub) = weak.upgrade() else {
                return false;
            };
            let mut queue = sub.queue.lock().expect("subscriber lock poisoned");
            if queue.len() >= sub.capacity {
                // Make room by dropping the oldest non-critical entry.
                let victim = queue.iter().position(|e| !e.event.is_critical());
                match victim {
                    Some(idx) => {
                        queue.remove(idx);
                    }
                    None if !envelope.event.is_critical() => {
                        // Queue is all-critical and the newcomer is not: drop it.
                        return true;
                    }
                    None => {}
                }
            }
            queue.push_back(envelope.clone());
            drop(queue);
            sub.notify.notify_one();
            true
        });
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock().expect("event bus lock poisoned");
        subscribers.retain(|weak| weak.strong_count() > 0);
        subscribers.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSubscriber {
    /// Wait for the next event.
    pub async fn recv(&self) -> MonitorEnvelope {
        loop {
            {
                let mut queue = self.inner.queue.lock().expect("subscriber lock poisoned");
                if let Some(envelope) = queue.pop_front() {
                    return envelope;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Drain whatever is buffered right now.
    pub fn drain(&self) -> Vec<MonitorEnvelope> {
        let mut queue = self.inner.queue.lock().expect("subscriber lock poisoned");
        queue.drain(..).collect()
    }

    pub fn pending(&self) -> usize {
        self.inner.queue.lock().expect("subscriber lock poisoned").len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use fc_core::types::SessionStatus;
    use uuid::Uuid;

    fn turn_event(turn: u32) -> MonitorEvent {
        MonitorEvent::TurnStarted {
            session_id: Uuid::nil(),
            turn,
        }
    }

    fn critical_event() -> MonitorEvent {
        MonitorEvent::SessionEnded {
            session_id: Uuid::nil(),
            status: SessionStatus::Completed,
        }
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        bus.publish(turn_event(1));
        bus.publish(turn_event(2));

        let first = sub.recv().await;
        let second = sub.recv().await;
        assert!(matches!(first.event, MonitorEvent::TurnStarted { turn: 1, .. }));
        assert!(matches!(second.event, MonitorEvent::TurnStarted { turn: 2, .. }));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        bus.publish(turn_event(1));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn back_pressure_drops_oldest_non_critical() {
        let bus = EventBus::new();
        let sub = bus.subscribe_with_capacity(3);
        bus.publish(turn_event(1));
        bus.publish(critical_event());
        bus.publish(turn_event(2));
        bus.publish(turn_event(3)); // overflows: turn 1 is dropped

        let events = sub.drain();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0].event, MonitorEvent::SessionEnded { .. }));
        assert!(matches!(events[1].event, MonitorEvent::TurnStarted { turn: 2, .. }));
        assert!(matches!(events[2].event, MonitorEvent::TurnStarted { turn: 3, .. }));
    }

    #[test]
    fn critical_events_survive_full_queue() {
        let bus = EventBus::new();
        let sub = bus.subscribe_with_capacity(2);
        bus.publish(turn_event(1));
        bus.publish(turn_event(2));
        bus.publish(critical_event());

        let events = sub.drain();
        assert!(events
            .iter()
            .any(|e| matches!(e.event, MonitorEvent::SessionEnded { .. })));
    }

    #[test]
    fn all_critical_queue_drops_non_critical_newcomer() {
        let bus = EventBus::new();
        let sub = bus.subscribe_with_capacity(2);
        bus.publish(critical_event());
        bus.publish(critical_event());
        bus.publish(turn_event(9));

        let events = sub.drain();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.event.is_critical()));
    }

    #[test]
    fn per_source_ordering_is_preserved() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        for i in 0..20 {
            bus.publish(turn_event(i));
        }
        let events = sub.drain();
        let turns: Vec<u32> = events
            .iter()
            .filter_map(|e| match e.event {
                MonitorEvent::TurnStarted { turn, .. } => Some(turn),
                _ => None,
            })
            .collect();
        assert_eq!(turns, (0..20).collect::<Vec<_>>());
    }
}
