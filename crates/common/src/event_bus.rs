//! Fire-and-forget notification boundary.
//!
//! The dispatcher publishes job lifecycle events here; WebSocket or other
//! transports subscribe downstream. Publishing never blocks job processing
//! and delivery is best-effort.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(pub &'static str);

#[derive(Debug, Clone)]
pub struct EventEnvelope<T: Clone + Send + Sync + Debug + 'static> {
    pub topic: Topic,
    pub payload: T,
    pub ts_ms: u128,
}

#[derive(Clone)]
pub struct EventBus<T: Clone + Send + Sync + Debug + 'static> {
    inner: Arc<RwLock<Inner<T>>>,
    subscribe_buffer: usize,
}

struct Inner<T: Clone + Send + Sync + Debug + 'static> {
    topics: HashMap<&'static str, broadcast::Sender<EventEnvelope<T>>>,
}

impl<T: Clone + Send + Sync + Debug + 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl<T: Clone + Send + Sync + Debug + 'static> EventBus<T> {
    pub fn new(subscribe_buffer: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                topics: HashMap::new(),
            })),
            subscribe_buffer,
        }
    }

    async fn ensure_topic(&self, topic: &Topic) {
        let mut inner = self.inner.write().await;
        if !inner.topics.contains_key(topic.0) {
            let (tx, _rx) = broadcast::channel(self.subscribe_buffer);
            inner.topics.insert(topic.0, tx);
            info!(target: "event_bus", topic = topic.0, "created topic");
        }
    }

    /// Publish an event. Never blocks; a lagging or absent subscriber only
    /// produces a warning.
    pub async fn publish(&self, topic: Topic, payload: T) {
        self.ensure_topic(&topic).await;
        let envelope = EventEnvelope {
            topic: topic.clone(),
            payload,
            ts_ms: current_ts_ms(),
        };
        let tx_opt = { self.inner.read().await.topics.get(topic.0).cloned() };
        match tx_opt {
            Some(tx) => match tx.send(envelope) {
                Ok(_) => debug!(target: "event_bus", topic = topic.0, "published"),
                Err(_) => warn!(target: "event_bus", topic = topic.0, "no subscribers"),
            },
            None => warn!(target: "event_bus", topic = topic.0, "no topic sender found"),
        }
    }

    pub async fn subscribe(&self, topic: Topic) -> broadcast::Receiver<EventEnvelope<T>> {
        self.ensure_topic(&topic).await;
        self.inner
            .read()
            .await
            .topics
            .get(topic.0)
            .expect("topic must exist")
            .subscribe()
    }
}

fn current_ts_ms() -> u128 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_subscribe_basic() {
        let bus: EventBus<String> = EventBus::new(8);
        let mut rx = bus.subscribe(Topic("test.topic")).await;
        bus.publish(Topic("test.topic"), "hello".to_string()).await;
        let evt = rx.recv().await.expect("should receive");
        assert_eq!(evt.topic.0, "test.topic");
        assert_eq!(evt.payload, "hello".to_string());
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus: EventBus<u64> = EventBus::default();
        bus.publish(Topic("no.subscribers"), 42).await;
    }
}
