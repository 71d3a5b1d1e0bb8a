//! Shared-state primitives: the sharded session registry and id generation.

pub mod ids;
pub mod registry;

pub use ids::{SequentialIds, SessionId, SessionIdGenerator};
pub use registry::{Disposable, RegistryError, ShardedRegistry, SHARD_COUNT};
