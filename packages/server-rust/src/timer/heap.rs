//! Binary min-heap of timer tasks ordered by `(fire_at, id)`.
//!
//! Each task records its own slot in `heap_index`, kept current on every
//! swap, so cancellation can remove from the middle of the heap in
//! `O(log n)` once the slot is found.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

/// Identifier of a scheduled timer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How many times a task fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    Forever,
    Times(u64),
}

pub(crate) type Callback = Box<dyn FnMut() + Send>;

pub(crate) struct TimerTask {
    pub id: TaskId,
    pub fire_at: Instant,
    pub interval: Duration,
    /// Fires left including the next one; `None` repeats forever.
    pub remaining: Option<u64>,
    pub callback: Callback,
    pub heap_index: usize,
}

impl TimerTask {
    pub fn new(id: TaskId, interval: Duration, repeat: Repeat, callback: Callback) -> Self {
        Self {
            id,
            fire_at: Instant::now() + interval,
            interval,
            remaining: match repeat {
                Repeat::Forever => None,
                Repeat::Times(n) => Some(n),
            },
            callback,
            heap_index: 0,
        }
    }

    /// Consumes one fire. Returns `true` if the task must be rescheduled.
    pub fn consume(&mut self) -> bool {
        match self.remaining {
            None => true,
            Some(n) if n > 1 => {
                self.remaining = Some(n - 1);
                true
            }
            Some(_) => false,
        }
    }
}

impl fmt::Debug for TimerTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerTask")
            .field("id", &self.id)
            .field("fire_at", &self.fire_at)
            .field("interval", &self.interval)
            .field("remaining", &self.remaining)
            .field("heap_index", &self.heap_index)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub(crate) struct TimerHeap {
    tasks: Vec<TimerTask>,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn peek(&self) -> Option<&TimerTask> {
        self.tasks.first()
    }

    pub fn push(&mut self, mut task: TimerTask) {
        let index = self.tasks.len();
        task.heap_index = index;
        self.tasks.push(task);
        self.sift_up(index);
    }

    pub fn pop(&mut self) -> Option<TimerTask> {
        if self.tasks.is_empty() {
            None
        } else {
            Some(self.remove_at(0))
        }
    }

    /// Linear scan for the slot holding `id`.
    pub fn position(&self, id: TaskId) -> Option<usize> {
        self.tasks.iter().position(|t| t.id == id)
    }

    /// Removes the task at `index` by swapping in the last task and
    /// restoring the heap property around it.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn remove_at(&mut self, index: usize) -> TimerTask {
        let removed = self.tasks.swap_remove(index);
        if index < self.tasks.len() {
            self.tasks[index].heap_index = index;
            self.sift_down(index);
            self.sift_up(index);
        }
        removed
    }

    fn less(&self, a: usize, b: usize) -> bool {
        let (x, y) = (&self.tasks[a], &self.tasks[b]);
        (x.fire_at, x.id) < (y.fire_at, y.id)
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.tasks.swap(a, b);
        self.tasks[a].heap_index = a;
        self.tasks[b].heap_index = b;
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if !self.less(index, parent) {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.tasks.len();
        loop {
            let left = 2 * index + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.less(right, left) {
                right
            } else {
                left
            };
            if !self.less(child, index) {
                break;
            }
            self.swap(index, child);
            index = child;
        }
    }
}
