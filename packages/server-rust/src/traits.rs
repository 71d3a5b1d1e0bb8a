//! Seams to external infrastructure the server can plug into.
//!
//! The engine never depends on a concrete discovery service or broker; it
//! only talks to these traits. In-memory implementations live in
//! [`crate::memory`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Change observed under a watched key prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A key was created or its value replaced.
    Put { key: String, value: String },
    /// A key was removed or its lease expired.
    Delete { key: String },
}

/// Receives watch events. Called from the discovery client's own task.
pub type WatchCallback = Arc<dyn Fn(WatchEvent) + Send + Sync>;

/// Key/value service registry (etcd-style): servers announce their
/// address under a key with a lease and peers watch a prefix.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// Publishes `value` under `key`, kept alive for `ttl`.
    async fn register(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()>;

    /// Removes `key`.
    async fn deregister(&self, key: &str) -> anyhow::Result<()>;

    /// Streams changes under `prefix` to `callback`, starting with the
    /// keys that already exist.
    async fn watch(&self, prefix: &str, callback: WatchCallback) -> anyhow::Result<()>;
}

/// Topic-based message broker (Kafka/NATS-style).
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes one message to every current subscriber of `topic`.
    async fn publish(&self, topic: &str, payload: Bytes) -> anyhow::Result<()>;

    /// Subscribes to `topic`. The receiver ends when the bus drops the topic.
    async fn subscribe(&self, topic: &str) -> anyhow::Result<mpsc::Receiver<Bytes>>;
}
