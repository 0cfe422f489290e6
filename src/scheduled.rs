//! Deadline-ordered task storage and the cancellation handle.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use crate::error::LoopError;
use crate::eventloop::EventLoop;
use crate::future::{EventFuture, Promise};

/// A unit of work queued on an event loop.
///
/// Exactly one of `run` and `fail` is invoked over the task's lifetime:
/// `run` when the loop executes it at or after its deadline, `fail` when the
/// loop terminates with the task still queued. Identity is the `id`; two
/// tasks with equal deadlines are still distinct.
pub(crate) struct ScheduledTask {
    pub(crate) id: u64,
    pub(crate) ready_time: Instant,
    pub(crate) run: Box<dyn FnOnce() + Send>,
    pub(crate) fail: Box<dyn FnOnce(LoopError) + Send>,
}

impl ScheduledTask {
    fn key(&self) -> (Instant, u64) {
        (self.ready_time, self.id)
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("id", &self.id)
            .field("ready_time", &self.ready_time)
            .finish()
    }
}

/// Binary min-heap of [`ScheduledTask`]s keyed by deadline, with a secondary
/// identity index for O(log n) removal of a specific task.
///
/// Ties on the deadline are broken by the insertion id, so equal-deadline
/// tasks pop in submission order. Not thread-safe; the owning loop guards it
/// with its task mutex.
#[derive(Debug)]
pub(crate) struct TimerQueue {
    heap: Vec<ScheduledTask>,
    position: HashMap<u64, usize>,
}

impl TimerQueue {
    pub(crate) fn new() -> TimerQueue {
        TimerQueue {
            heap: Vec::new(),
            position: HashMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// The earliest deadline currently queued.
    pub(crate) fn peek_deadline(&self) -> Option<Instant> {
        self.heap.first().map(|task| task.ready_time)
    }

    pub(crate) fn push(&mut self, task: ScheduledTask) {
        let index = self.heap.len();
        self.position.insert(task.id, index);
        self.heap.push(task);
        self.sift_up(index);
    }

    /// Pops the task with the earliest deadline.
    pub(crate) fn pop(&mut self) -> Option<ScheduledTask> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.swap(0, last);
        let task = match self.heap.pop() {
            Some(task) => task,
            None => return None,
        };
        self.position.remove(&task.id);
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        Some(task)
    }

    /// Removes a specific task by identity, wherever it sits in the heap.
    pub(crate) fn remove(&mut self, id: u64) -> Option<ScheduledTask> {
        let index = match self.position.get(&id) {
            Some(index) => *index,
            None => return None,
        };
        let last = self.heap.len() - 1;
        self.swap(index, last);
        let task = match self.heap.pop() {
            Some(task) => task,
            None => return None,
        };
        self.position.remove(&task.id);
        if index < self.heap.len() {
            // The displaced element may violate the heap property in
            // either direction.
            self.sift_down(index);
            self.sift_up(index);
        }
        Some(task)
    }

    /// Empties the queue in deadline order.
    pub(crate) fn drain(&mut self) -> Vec<ScheduledTask> {
        let mut drained = Vec::with_capacity(self.heap.len());
        while let Some(task) = self.pop() {
            drained.push(task);
        }
        drained
    }

    fn less(&self, a: usize, b: usize) -> bool {
        self.heap[a].key().cmp(&self.heap[b].key()) == Ordering::Less
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.heap.swap(a, b);
        self.position.insert(self.heap[a].id, a);
        self.position.insert(self.heap[b].id, b);
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.less(index, parent) {
                self.swap(index, parent);
                index = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        loop {
            let left = 2 * index + 1;
            let right = 2 * index + 2;
            let mut smallest = index;
            if left < self.heap.len() && self.less(left, smallest) {
                smallest = left;
            }
            if right < self.heap.len() && self.less(right, smallest) {
                smallest = right;
            }
            if smallest == index {
                break;
            }
            self.swap(index, smallest);
            index = smallest;
        }
    }
}

/// Handle to a task scheduled for a future deadline: exposes the result
/// future and best-effort cancellation.
pub struct Scheduled<T> {
    future: EventFuture<T>,
    promise: Promise<T>,
    executor: EventLoop,
    task_id: Option<u64>,
}

impl<T: Send + Sync + 'static> Scheduled<T> {
    pub(crate) fn new(
        future: EventFuture<T>,
        promise: Promise<T>,
        executor: EventLoop,
        task_id: Option<u64>,
    ) -> Scheduled<T> {
        Scheduled {
            future,
            promise,
            executor,
            task_id,
        }
    }

    /// The future resolved by the task's execution, failure or
    /// cancellation.
    pub fn future_result(&self) -> EventFuture<T> {
        self.future.clone()
    }

    /// Cancels the task if it has not produced an outcome yet.
    ///
    /// On the first cancellation before execution the result future fails
    /// with [`LoopError::Cancelled`], the task is removed from its loop's
    /// timer queue, and a selector wakeup lets the loop recompute its wait
    /// strategy. Cancelling a task that already ran (or was already
    /// cancelled) is a no-op. A task that has been dequeued for execution
    /// but whose future the cancellation reached first is skipped by the
    /// loop rather than run.
    pub fn cancel(&self) {
        if !self.promise.try_fail(LoopError::Cancelled) {
            return;
        }
        if let Some(id) = self.task_id {
            self.executor.remove_scheduled(id);
        }
    }
}

impl<T> fmt::Debug for Scheduled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduled")
            .field("task_id", &self.task_id)
            .finish()
    }
}
