//! A deadline-ordered timer queue, integrated with the manager's wait loop:
//! the loop always computes its next wait timeout from the queue's nearest
//! deadline, then drains everything due before touching sockets again.
//!
//! There is no cancellation API. A scheduled callback that's no longer
//! wanted should check a staleness flag in its own context on firing,
//! matching the original's "timers cannot be cancelled, only superseded"
//! contract.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Opaque handle returned by [`TimerQueue::push`]; carries no cancellation
/// capability, only identity for logging/debugging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(u64);

struct Entry {
    deadline: Instant,
    id: TimerId,
    callback: Box<dyn FnOnce() + Send>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline).then(self.id.0.cmp(&other.id.0))
    }
}

/// A mutex-guarded min-heap of pending timers, safe to push to from any
/// thread (matching the requirement that `schedule_ms`/`schedule_at` be
/// callable off the loop thread).
pub struct TimerQueue {
    heap: Mutex<BinaryHeap<Reverse<Entry>>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Schedule `callback` to run at `deadline`.
    pub fn push_at(&self, deadline: Instant, callback: impl FnOnce() + Send + 'static) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed));
        let entry = Entry {
            deadline,
            id,
            callback: Box::new(callback),
        };
        self.heap.lock().expect("timer queue lock poisoned").push(Reverse(entry));
        id
    }

    /// Schedule `callback` to run `delay` from now.
    pub fn push_in(&self, delay: Duration, callback: impl FnOnce() + Send + 'static) -> TimerId {
        self.push_at(Instant::now() + delay, callback)
    }

    /// The deadline of the next timer to fire, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap
            .lock()
            .expect("timer queue lock poisoned")
            .peek()
            .map(|Reverse(entry)| entry.deadline)
    }

    /// How long until the next timer fires, `None` if the queue is empty,
    /// `Some(Duration::ZERO)` if one is already due. Used by the loop to
    /// compute its socket-wait timeout.
    pub fn next_timeout(&self) -> Option<Duration> {
        let deadline = self.next_deadline()?;
        Some(deadline.saturating_duration_since(Instant::now()))
    }

    /// Pop and run every timer whose deadline has passed, in deadline order.
    /// Returns the number of callbacks run.
    pub fn run_due(&self) -> usize {
        let mut fired = 0;
        loop {
            let due = {
                let mut heap = self.heap.lock().expect("timer queue lock poisoned");
                match heap.peek() {
                    Some(Reverse(entry)) if entry.deadline <= Instant::now() => {
                        heap.pop().map(|Reverse(entry)| entry)
                    }
                    _ => None,
                }
            };
            match due {
                Some(entry) => {
                    (entry.callback)();
                    fired += 1;
                }
                None => break,
            }
        }
        fired
    }

    pub fn len(&self) -> usize {
        self.heap.lock().expect("timer queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
