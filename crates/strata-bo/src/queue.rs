//! Two-priority work queue local to each node.
//!
//! A fixed pool of OS worker threads drains two FIFO queues. Whenever a
//! worker goes looking for work, every ready high-priority task is taken
//! before any low-priority task; there is no thread preemption. Tasks are
//! opaque nullary closures and are not individually cancellable.
//!
//! The pool lives on the heap behind this handle and is torn down by
//! `shutdown()` or `Drop`, whichever comes first: remaining queued tasks
//! are drained, then workers are joined.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use strata_error::{BoError, Result};
use strata_types::BoPriority;
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runtime configuration for a [`WorkQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkQueueConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Combined bound on queued (not yet running) tasks across both
    /// priority classes. `None` leaves the queue unbounded.
    pub capacity: Option<usize>,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            capacity: None,
        }
    }
}

impl WorkQueueConfig {
    pub fn validate(self) -> Result<Self> {
        if self.workers == 0 {
            return Err(BoError::InvalidTask("work queue needs at least one worker"));
        }
        if self.capacity == Some(0) {
            return Err(BoError::InvalidTask("work queue capacity must be > 0"));
        }
        Ok(self)
    }
}

#[derive(Default)]
struct QueueState {
    high: VecDeque<Job>,
    low: VecDeque<Job>,
    in_flight: usize,
}

impl QueueState {
    fn pending(&self) -> usize {
        self.high.len() + self.low.len()
    }

    fn pop(&mut self) -> Option<Job> {
        self.high.pop_front().or_else(|| self.low.pop_front())
    }
}

struct QueueShared {
    state: Mutex<QueueState>,
    /// Signalled when a task is enqueued or shutdown begins.
    available: Condvar,
    /// Signalled when the queue drains and the last task completes.
    idle: Condvar,
    stop: AtomicBool,
    capacity: Option<usize>,
}

/// Fixed-size two-priority worker pool.
pub struct WorkQueue {
    shared: Arc<QueueShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkQueue {
    pub fn new(config: WorkQueueConfig) -> Result<Self> {
        let config = config.validate()?;
        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            idle: Condvar::new(),
            stop: AtomicBool::new(false),
            capacity: config.capacity,
        });

        let mut workers = Vec::with_capacity(config.workers);
        for worker_index in 0..config.workers {
            let shared = Arc::clone(&shared);
            let join = thread::Builder::new()
                .name(format!("strata-bo-worker-{worker_index}"))
                .spawn(move || worker_loop(&shared))
                .map_err(BoError::from)?;
            workers.push(join);
        }

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Enqueue a task. Returns `false` when the queue is shutting down or
    /// a configured capacity bound is hit; the task is dropped in that
    /// case and the caller decides whether to retry later.
    pub fn enqueue<F>(&self, priority: BoPriority, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.stop.load(AtomicOrdering::Acquire) {
            return false;
        }

        let mut state = match self.shared.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(capacity) = self.shared.capacity {
            if state.pending() >= capacity {
                warn!(
                    event = "work_queue_full",
                    capacity,
                    pending = state.pending()
                );
                return false;
            }
        }
        match priority {
            BoPriority::High => state.high.push_back(Box::new(job)),
            BoPriority::Low => state.low.push_back(Box::new(job)),
        }
        drop(state);
        self.shared.available.notify_one();
        true
    }

    /// Queued tasks per priority class, `(high, low)`.
    #[must_use]
    pub fn pending(&self) -> (usize, usize) {
        let state = match self.shared.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        (state.high.len(), state.low.len())
    }

    /// Tasks currently executing on workers.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        let state = match self.shared.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.in_flight
    }

    /// Block until both queues are empty and no task is executing.
    pub fn wait_idle(&self) {
        let mut state = match self.shared.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        while state.pending() > 0 || state.in_flight > 0 {
            state = match self.shared.idle.wait(state) {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Drain remaining tasks, then stop and join every worker. Safe to
    /// call more than once; later calls are no-ops.
    pub fn shutdown(&self) {
        if self.shared.stop.swap(true, AtomicOrdering::AcqRel) {
            return;
        }
        self.shared.available.notify_all();
        let joins = {
            let mut workers = match self.workers.lock() {
                Ok(workers) => workers,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *workers)
        };
        for join in joins {
            let _ = join.join();
        }
        debug!(event = "work_queue_stopped");
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &QueueShared) {
    loop {
        let job = {
            let mut state = match shared.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            loop {
                if let Some(job) = state.pop() {
                    state.in_flight += 1;
                    break job;
                }
                if shared.stop.load(AtomicOrdering::Acquire) {
                    return;
                }
                state = match shared.available.wait(state) {
                    Ok(state) => state,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
        };

        job();

        let mut state = match shared.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.in_flight -= 1;
        if state.pending() == 0 && state.in_flight == 0 {
            shared.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn executes_enqueued_tasks() {
        let queue = WorkQueue::new(WorkQueueConfig::default()).expect("queue");
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            assert!(queue.enqueue(BoPriority::Low, move || {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
            }));
        }
        queue.wait_idle();
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 32);
        queue.shutdown();
    }

    #[test]
    fn high_priority_dispatches_before_low() {
        // One worker, held busy while both queues fill, so the dispatch
        // order is fully determined by priority.
        let queue = WorkQueue::new(WorkQueueConfig {
            workers: 1,
            capacity: None,
        })
        .expect("queue");

        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        queue.enqueue(BoPriority::Low, move || {
            gate_rx.recv().expect("gate");
        });

        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["low-1", "low-2"] {
            let order = Arc::clone(&order);
            queue.enqueue(BoPriority::Low, move || {
                order.lock().unwrap().push(label);
            });
        }
        for label in ["high-1", "high-2"] {
            let order = Arc::clone(&order);
            queue.enqueue(BoPriority::High, move || {
                order.lock().unwrap().push(label);
            });
        }

        gate_tx.send(()).expect("open gate");
        queue.wait_idle();
        assert_eq!(
            *order.lock().unwrap(),
            vec!["high-1", "high-2", "low-1", "low-2"]
        );
        queue.shutdown();
    }

    #[test]
    fn bounded_queue_rejects_when_full() {
        let queue = WorkQueue::new(WorkQueueConfig {
            workers: 1,
            capacity: Some(2),
        })
        .expect("queue");

        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        queue.enqueue(BoPriority::Low, move || {
            gate_rx.recv().expect("gate");
        });
        // Give the worker a moment to take the gate task off the queue.
        std::thread::sleep(Duration::from_millis(50));

        assert!(queue.enqueue(BoPriority::Low, || {}));
        assert!(queue.enqueue(BoPriority::High, || {}));
        assert!(!queue.enqueue(BoPriority::Low, || {}));
        assert!(!queue.enqueue(BoPriority::High, || {}));

        gate_tx.send(()).expect("open gate");
        queue.wait_idle();
        assert!(queue.enqueue(BoPriority::Low, || {}));
        queue.shutdown();
    }

    #[test]
    fn shutdown_drains_pending_tasks() {
        let queue = WorkQueue::new(WorkQueueConfig {
            workers: 2,
            capacity: None,
        })
        .expect("queue");
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..64 {
            let counter = Arc::clone(&counter);
            queue.enqueue(BoPriority::Low, move || {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
            });
        }
        queue.shutdown();
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 64);
    }

    #[test]
    fn enqueue_after_shutdown_is_refused() {
        let queue = WorkQueue::new(WorkQueueConfig {
            workers: 1,
            capacity: None,
        })
        .expect("queue");
        queue.shutdown();
        assert!(!queue.enqueue(BoPriority::High, || {}));
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(WorkQueue::new(WorkQueueConfig {
            workers: 0,
            capacity: None
        })
        .is_err());
        assert!(WorkQueueConfig {
            workers: 1,
            capacity: Some(0)
        }
        .validate()
        .is_err());
    }
}
