//! Heap-based timer wheel driving heartbeats and other periodic work.

pub mod heap;
pub mod wheel;

pub use heap::{Repeat, TaskId};
pub use wheel::{TimerError, TimerWheel, DEFAULT_TICK};
