//! Per-key FIFO task dispatch.
//!
//! Handlers for the same logical key (an endpoint UUID, a security-group-set
//! id, an interface name) must never run concurrently or out of order, while
//! handlers for distinct keys may run in parallel. `TaskQueue` maps each key
//! to an ordered queue of closures and drains each key on the blocking
//! worker pool, one task at a time per key.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::debug;

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<Task>>,
    active: HashSet<String>,
    stopped: bool,
}

struct Inner {
    state: Mutex<State>,
    idle: Notify,
}

/// Keyed task queue with per-key FIFO serialization.
///
/// Must be created from within a tokio runtime; workers run on the
/// runtime's blocking pool. Tasks dispatched after [`TaskQueue::stop`] are
/// silently dropped.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
    handle: Handle,
}

impl TaskQueue {
    /// Creates a queue bound to the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime context.
    pub fn new() -> Self {
        TaskQueue {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                idle: Notify::new(),
            }),
            handle: Handle::current(),
        }
    }

    /// Enqueues `task` under `key`.
    ///
    /// Tasks for the same key run in dispatch order, one at a time; tasks
    /// for distinct keys may run concurrently. May be called from any
    /// thread.
    pub fn dispatch<F>(&self, key: impl Into<String>, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let key = key.into();
        let spawn_worker = {
            let mut state = self.inner.state.lock().unwrap();
            if state.stopped {
                debug!(key = key.as_str(), "dropping task dispatched after stop");
                return;
            }
            state
                .queues
                .entry(key.clone())
                .or_default()
                .push_back(Box::new(task));
            state.active.insert(key.clone())
        };

        if spawn_worker {
            let inner = Arc::clone(&self.inner);
            self.handle.spawn_blocking(move || drain_key(inner, key));
        }
    }

    /// Stops the queue: subsequent dispatches are dropped. Already queued
    /// tasks are still drained.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.stopped = true;
    }

    /// Returns the number of tasks waiting to run (not counting tasks
    /// currently executing).
    pub fn pending(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.queues.values().map(|q| q.len()).sum()
    }

    /// Waits until no key has queued or running work.
    pub async fn wait_idle(&self) {
        loop {
            let mut notified = std::pin::pin!(self.inner.idle.notified());
            // Register for wakeups before inspecting state so a completion
            // between the check and the await is not missed.
            notified.as_mut().enable();
            {
                let state = self.inner.state.lock().unwrap();
                if state.active.is_empty() && state.queues.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn drain_key(inner: Arc<Inner>, key: String) {
    loop {
        let task = {
            let mut state = inner.state.lock().unwrap();
            match state.queues.get_mut(&key).and_then(|q| q.pop_front()) {
                Some(task) => task,
                None => {
                    state.queues.remove(&key);
                    state.active.remove(&key);
                    if state.active.is_empty() && state.queues.is_empty() {
                        inner.idle.notify_waiters();
                    }
                    return;
                }
            }
        };
        task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_tasks_run() {
        let queue = TaskQueue::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let count = Arc::clone(&count);
            queue.dispatch("key", move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        queue.wait_idle().await;
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_same_key_fifo() {
        let queue = TaskQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            let order = Arc::clone(&order);
            queue.dispatch("ep-1", move || {
                order.lock().unwrap().push(i);
            });
        }
        queue.wait_idle().await;
        let order = order.lock().unwrap();
        assert_eq!(*order, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_distinct_keys_progress() {
        let queue = TaskQueue::new();
        let count = Arc::new(AtomicUsize::new(0));
        for key in ["a", "b", "c", "d"] {
            for _ in 0..25 {
                let count = Arc::clone(&count);
                queue.dispatch(key, move || {
                    count.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        queue.wait_idle().await;
        assert_eq!(count.load(Ordering::SeqCst), 100);
    }

    #[tokio::test]
    async fn test_dispatch_after_stop_is_dropped() {
        let queue = TaskQueue::new();
        queue.stop();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        queue.dispatch("key", move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        queue.wait_idle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_from_task() {
        let queue = TaskQueue::new();
        let count = Arc::new(AtomicUsize::new(0));
        let inner_queue = queue.clone();
        let c = Arc::clone(&count);
        queue.dispatch("outer", move || {
            let c2 = Arc::clone(&c);
            inner_queue.dispatch("inner", move || {
                c2.fetch_add(1, Ordering::SeqCst);
            });
            c.fetch_add(1, Ordering::SeqCst);
        });
        queue.wait_idle().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
