//! In-process implementations of the collaborator traits.
//!
//! Useful for tests and single-node deployments. Leases are not enforced:
//! `MemoryDiscovery` keeps keys until they are deregistered.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::traits::{MessageBus, ServiceDiscovery, WatchCallback, WatchEvent};

// ---------------------------------------------------------------------------
// MemoryDiscovery
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryDiscovery {
    entries: Mutex<BTreeMap<String, String>>,
    watchers: Mutex<Vec<(String, WatchCallback)>>,
}

impl MemoryDiscovery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn notify(&self, key: &str, event: &WatchEvent) {
        let watchers: Vec<_> = self
            .watchers
            .lock()
            .iter()
            .filter(|(prefix, _)| key.starts_with(prefix.as_str()))
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in watchers {
            cb(event.clone());
        }
    }
}

#[async_trait]
impl ServiceDiscovery for MemoryDiscovery {
    async fn register(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        trace!(key, value, ?ttl, "register");
        self.entries.lock().insert(key.to_string(), value.to_string());
        self.notify(
            key,
            &WatchEvent::Put {
                key: key.to_string(),
                value: value.to_string(),
            },
        );
        Ok(())
    }

    async fn deregister(&self, key: &str) -> anyhow::Result<()> {
        let removed = self.entries.lock().remove(key).is_some();
        if removed {
            self.notify(key, &WatchEvent::Delete { key: key.to_string() });
        }
        Ok(())
    }

    async fn watch(&self, prefix: &str, callback: WatchCallback) -> anyhow::Result<()> {
        let existing: Vec<_> = self
            .entries
            .lock()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| WatchEvent::Put {
                key: k.clone(),
                value: v.clone(),
            })
            .collect();
        for event in existing {
            callback(event);
        }
        self.watchers.lock().push((prefix.to_string(), callback));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryBus
// ---------------------------------------------------------------------------

pub struct MemoryBus {
    capacity: usize,
    topics: Mutex<HashMap<String, Vec<mpsc::Sender<Bytes>>>>,
}

impl MemoryBus {
    /// Creates a bus whose subscriber queues hold `capacity` messages.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> anyhow::Result<()> {
        let subscribers = {
            let mut topics = self.topics.lock();
            let Some(subs) = topics.get_mut(topic) else {
                return Ok(());
            };
            subs.retain(|tx| !tx.is_closed());
            subs.clone()
        };
        for tx in subscribers {
            // A subscriber that went away mid-publish is simply skipped.
            let _ = tx.send(payload.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> anyhow::Result<mpsc::Receiver<Bytes>> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.topics.lock().entry(topic.to_string()).or_default().push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn watch_replays_existing_then_streams_changes() {
        let discovery = MemoryDiscovery::new();
        discovery.register("gate/1", "10.0.0.1:10001", Duration::from_secs(10)).await.unwrap();
        discovery.register("zone/1", "10.0.0.2:10001", Duration::from_secs(10)).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        discovery
            .watch("gate/", Arc::new(move |e| sink.lock().push(e)))
            .await
            .unwrap();
        discovery.register("gate/2", "10.0.0.3:10001", Duration::from_secs(10)).await.unwrap();
        discovery.deregister("gate/1").await.unwrap();
        discovery.deregister("gate/missing").await.unwrap();

        let seen = seen.lock().clone();
        assert_eq!(
            seen,
            vec![
                WatchEvent::Put { key: "gate/1".into(), value: "10.0.0.1:10001".into() },
                WatchEvent::Put { key: "gate/2".into(), value: "10.0.0.3:10001".into() },
                WatchEvent::Delete { key: "gate/1".into() },
            ]
        );
        assert_eq!(discovery.get("zone/1").as_deref(), Some("10.0.0.2:10001"));
    }

    #[tokio::test]
    async fn bus_fans_out_to_subscribers() {
        let bus = MemoryBus::default();
        let mut a = bus.subscribe("chat").await.unwrap();
        let mut b = bus.subscribe("chat").await.unwrap();
        let mut other = bus.subscribe("trade").await.unwrap();

        bus.publish("chat", Bytes::from_static(b"hi")).await.unwrap();

        assert_eq!(a.recv().await.unwrap(), Bytes::from_static(b"hi"));
        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"hi"));
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_skips_dropped_subscribers() {
        let bus = MemoryBus::new(4);
        let dropped = bus.subscribe("t").await.unwrap();
        let mut kept = bus.subscribe("t").await.unwrap();
        drop(dropped);

        bus.publish("t", Bytes::from_static(b"x")).await.unwrap();
        bus.publish("nobody", Bytes::from_static(b"y")).await.unwrap();
        assert_eq!(kept.recv().await.unwrap(), Bytes::from_static(b"x"));
    }
}
