use crate::events::{EventKind, PipelineEvent};
use futures::future::{join_all, BoxFuture};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A subscriber callback. Handlers may do their own async work; the bus
/// awaits every handler of a publish before returning to the publisher.
pub type EventHandler = Arc<dyn Fn(PipelineEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handle returned by `subscribe*`, used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Subscribers {
    by_kind: HashMap<EventKind, Vec<(u64, EventHandler)>>,
    /// Handlers receiving every event kind (the WebSocket broadcaster).
    all: Vec<(u64, EventHandler)>,
}

/// Typed pub/sub bus.
///
/// `publish` snapshots the handler list for the event's kind under the
/// subscribers lock, releases it, then runs every handler as its own task.
/// Handler panics are caught at the join point and logged; they never reach
/// sibling handlers or the publisher. Subscribe/unsubscribe are synchronous
/// and safe against concurrent publishes.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Subscribers>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an async closure into the boxed handler shape.
    pub fn handler<F, Fut>(f: F) -> EventHandler
    where
        F: Fn(PipelineEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        Arc::new(move |event| Box::pin(f(event)))
    }

    pub fn subscribe(&self, kind: EventKind, handler: EventHandler) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subs = self.subscribers.write();
        subs.by_kind.entry(kind).or_default().push((id, handler));
        tracing::debug!(?kind, id, "subscribed handler");
        SubscriptionId(id)
    }

    /// Subscribe one handler to every event kind.
    pub fn subscribe_all(&self, handler: EventHandler) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subs = self.subscribers.write();
        subs.all.push((id, handler));
        tracing::debug!(id, "subscribed catch-all handler");
        SubscriptionId(id)
    }

    /// Remove a subscription; returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.write();
        let before = subs.all.len() + subs.by_kind.values().map(Vec::len).sum::<usize>();
        subs.all.retain(|(h, _)| *h != id.0);
        for handlers in subs.by_kind.values_mut() {
            handlers.retain(|(h, _)| *h != id.0);
        }
        let after = subs.all.len() + subs.by_kind.values().map(Vec::len).sum::<usize>();
        if before == after {
            tracing::warn!(id = id.0, "unsubscribe for unknown handler");
        }
        before != after
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        let subs = self.subscribers.read();
        subs.by_kind.get(&kind).map(Vec::len).unwrap_or(0) + subs.all.len()
    }

    /// Remove every subscription (test helper).
    pub fn clear(&self) {
        let mut subs = self.subscribers.write();
        subs.by_kind.clear();
        subs.all.clear();
    }

    /// Dispatch `event` to all handlers of its kind, concurrently, and wait
    /// for every handler to finish.
    pub async fn publish(&self, event: PipelineEvent) {
        let kind = event.kind();
        let handlers: Vec<EventHandler> = {
            let subs = self.subscribers.read();
            subs.by_kind
                .get(&kind)
                .into_iter()
                .flatten()
                .chain(subs.all.iter())
                .map(|(_, h)| h.clone())
                .collect()
        };

        if handlers.is_empty() {
            tracing::debug!(?kind, "no subscribers for event");
            return;
        }

        let tasks: Vec<_> = handlers
            .into_iter()
            .map(|h| tokio::spawn(h(event.clone())))
            .collect();

        for result in join_all(tasks).await {
            if let Err(err) = result {
                tracing::error!(?kind, %err, "event handler failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;

    fn started_event() -> PipelineEvent {
        PipelineEvent::PipelineStarted {
            pipeline_id: "p1".into(),
            pipeline_name: "t".into(),
            timestamp: Utc::now(),
            node_count: 1,
        }
    }

    #[tokio::test]
    async fn publish_reaches_kind_and_catch_all_subscribers() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h1 = hits.clone();
        bus.subscribe(
            EventKind::PipelineStarted,
            EventBus::handler(move |_| {
                let h = h1.clone();
                async move {
                    h.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        let h2 = hits.clone();
        bus.subscribe_all(EventBus::handler(move |_| {
            let h = h2.clone();
            async move {
                h.fetch_add(10, Ordering::SeqCst);
            }
        }));

        bus.publish(started_event()).await;
        assert_eq!(hits.load(Ordering::SeqCst), 11);
        assert_eq!(bus.subscriber_count(EventKind::PipelineStarted), 2);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_disturb_siblings() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        bus.subscribe(
            EventKind::PipelineStarted,
            EventBus::handler(|_| async { panic!("handler blew up") }),
        );
        let h = hits.clone();
        bus.subscribe(
            EventKind::PipelineStarted,
            EventBus::handler(move |_| {
                let h = h.clone();
                async move {
                    h.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        // Publish must return normally despite the panic.
        bus.publish(started_event()).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribed_handlers_stop_receiving() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = bus.subscribe(
            EventKind::PipelineStarted,
            EventBus::handler(move |_| {
                let h = h.clone();
                async move {
                    h.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        bus.publish(started_event()).await;
        assert!(bus.unsubscribe(id));
        bus.publish(started_event()).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!bus.unsubscribe(id));
    }
}
