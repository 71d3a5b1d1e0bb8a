//! Sequentially consistent scalar wrappers with compare-and-set retry loops.
//!
//! These give the session state machine, idle counters and the registry's
//! pending counter a small, uniform vocabulary (`increment_and_get`,
//! `compare_and_set`, ...) on top of `std::sync::atomic`.

use std::sync::atomic::{self, Ordering};

macro_rules! atomic_integer {
    ($(#[$meta:meta])* $name:ident, $inner:ty, $prim:ty) => {
        $(#[$meta])*
        #[derive(Debug, Default)]
        pub struct $name($inner);

        impl $name {
            #[must_use]
            pub const fn new(value: $prim) -> Self {
                Self(<$inner>::new(value))
            }

            #[must_use]
            pub fn get(&self) -> $prim {
                self.0.load(Ordering::SeqCst)
            }

            pub fn set(&self, value: $prim) {
                self.0.store(value, Ordering::SeqCst);
            }

            /// Stores `update` only if the current value equals `expect`.
            pub fn compare_and_set(&self, expect: $prim, update: $prim) -> bool {
                self.0
                    .compare_exchange(expect, update, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            }

            pub fn get_and_set(&self, value: $prim) -> $prim {
                self.update(|_| value).0
            }

            pub fn get_and_add(&self, delta: $prim) -> $prim {
                self.update(|v| v.wrapping_add(delta)).0
            }

            pub fn add_and_get(&self, delta: $prim) -> $prim {
                self.update(|v| v.wrapping_add(delta)).1
            }

            pub fn get_and_increment(&self) -> $prim {
                self.update(|v| v.wrapping_add(1)).0
            }

            pub fn get_and_decrement(&self) -> $prim {
                self.update(|v| v.wrapping_sub(1)).0
            }

            pub fn increment_and_get(&self) -> $prim {
                self.update(|v| v.wrapping_add(1)).1
            }

            pub fn decrement_and_get(&self) -> $prim {
                self.update(|v| v.wrapping_sub(1)).1
            }

            /// Retries `f` until the CAS lands; returns `(previous, next)`.
            fn update(&self, f: impl Fn($prim) -> $prim) -> ($prim, $prim) {
                loop {
                    let current = self.get();
                    let next = f(current);
                    if self.compare_and_set(current, next) {
                        return (current, next);
                    }
                }
            }
        }
    };
}

atomic_integer!(
    /// Atomic `i32`, used for small state machines and retry counters.
    AtomicInt32,
    atomic::AtomicI32,
    i32
);

atomic_integer!(
    /// Atomic `i64`, used for pending-work counters.
    AtomicInt64,
    atomic::AtomicI64,
    i64
);

atomic_integer!(
    /// Atomic `u64`, used for id generation.
    AtomicUint64,
    atomic::AtomicU64,
    u64
);

/// Atomic flag with the same CAS vocabulary as the integer wrappers.
#[derive(Debug, Default)]
pub struct AtomicBoolean(atomic::AtomicBool);

impl AtomicBoolean {
    #[must_use]
    pub const fn new(value: bool) -> Self {
        Self(atomic::AtomicBool::new(value))
    }

    #[must_use]
    pub fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, value: bool) {
        self.0.store(value, Ordering::SeqCst);
    }

    pub fn compare_and_set(&self, expect: bool, update: bool) -> bool {
        self.0
            .compare_exchange(expect, update, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn get_and_set(&self, value: bool) -> bool {
        loop {
            let current = self.get();
            if self.compare_and_set(current, value) {
                return current;
            }
        }
    }
}
