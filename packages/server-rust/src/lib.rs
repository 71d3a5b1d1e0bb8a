//! framewire server: a binary-protocol TCP server engine.
//!
//! Length-prefixed frames carry `[msg_id][payload]` messages. Each connection
//! becomes a [`Session`] with its own receive, dispatch and send loops; the
//! [`Server`] routes messages to registered handlers, drives heartbeats from
//! a shared [`TimerWheel`] and drains every session on stop.

pub mod concurrent;
pub mod memory;
pub mod network;
pub mod service;
pub mod timer;
pub mod traits;

pub use concurrent::{SessionId, SessionIdGenerator, ShardedRegistry};
pub use network::{Server, ServerConfig, ServerError, ServerHandle, Session, SessionConfig};
pub use service::{HandlerContext, HandlerError, HandlerResult, Router};
pub use timer::{Repeat, TaskId, TimerWheel};
pub use traits::{MessageBus, ServiceDiscovery};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
