use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::warn;

/// Ceiling on concurrently running handler invocations across all topics.
const DEFAULT_HANDLER_POOL: usize = 16;

/// Budget for a single handler invocation; a stuck handler cannot starve
/// publishers or its own queue forever.
const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub topic: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(topic: &str, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

pub type HandlerFuture = BoxFuture<'static, Result<(), crate::error::BackupError>>;
pub type EventHandler = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync>;

/// In-process topic → handler fan-out.
///
/// Each subscription owns a worker task fed by an ordered queue, so a single
/// handler sees events in publish order; there is no ordering guarantee
/// across handlers. Handler errors are logged and swallowed; they never
/// reach the publisher.
pub struct EventBus {
    topics: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<Event>>>>,
    permits: Arc<Semaphore>,
    handler_timeout: Duration,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(DEFAULT_HANDLER_POOL)),
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
        }
    }

    /// Register `handler` for `topic` and spawn its worker.
    pub fn subscribe(&self, topic: &str, handler: EventHandler) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        self.topics
            .write()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .push(tx);

        let permits = self.permits.clone();
        let timeout = self.handler_timeout;
        let topic = topic.to_string();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let _permit = permits
                    .acquire()
                    .await
                    .expect("event bus semaphore never closes");
                match tokio::time::timeout(timeout, handler(event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!("events: handler failed, topic={}, error={}", topic, e);
                    }
                    Err(_) => {
                        warn!(
                            "events: handler exceeded its {}s deadline, topic={}",
                            timeout.as_secs(),
                            topic
                        );
                    }
                }
            }
        });
    }

    /// Deliver `event` to every handler subscribed to its topic. Returns the
    /// number of handlers the event was queued for.
    pub fn publish(&self, event: Event) -> usize {
        let topics = self.topics.read().unwrap();
        let Some(senders) = topics.get(&event.topic) else {
            return 0;
        };
        let mut delivered = 0;
        for sender in senders {
            if sender.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        metrics::counter!("atlas_events_published_total", "topic" => event.topic.clone())
            .increment(1);
        delivered
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .unwrap()
            .get(topic)
            .map_or(0, |senders| senders.len())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
