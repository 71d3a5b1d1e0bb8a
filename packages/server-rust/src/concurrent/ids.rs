//! Session identifiers and the pluggable generator that hands them out.

use std::fmt;

use framewire_core::AtomicUint64;

/// Unique identifier for a session, assigned when it is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source of session ids. Injected into the server so deployments can
/// partition the id space (for example by embedding a node id).
pub trait SessionIdGenerator: Send + Sync {
    /// Returns an id that has never been returned before by this generator.
    fn next_id(&self) -> SessionId;
}

/// Monotonic generator starting at 1. Id 0 is never handed out.
#[derive(Debug)]
pub struct SequentialIds {
    next: AtomicUint64,
}

impl SequentialIds {
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Starts the sequence at `first`.
    #[must_use]
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicUint64::new(first),
        }
    }
}

impl Default for SequentialIds {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionIdGenerator for SequentialIds {
    fn next_id(&self) -> SessionId {
        SessionId(self.next.get_and_increment())
    }
}
