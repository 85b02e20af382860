// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Bounded worker pool for long-running background tasks.
//!
//! Model distribution runs a send → wait → measure loop that can block for
//! the whole dissemination pass; it must stay off the RPC threads so
//! further requests keep draining. The pool's size is fixed at
//! construction (default 1, and always 1 under LeMethod so distribution
//! passes execute in submission order).
//!
//! [`WorkerPool::enqueue`] hands back a [`TaskHandle`] resolving to the
//! task's return value. Queued tasks still run after [`WorkerPool::stop`];
//! new submissions fail with [`ServerError::PoolStopped`].

use crate::ServerError;
use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct TaskQueue {
    tasks: VecDeque<Task>,
    stopped: bool,
}

struct Shared {
    queue: Mutex<TaskQueue>,
    cond: Condvar,
}

/// A future-like handle to a task submitted to the pool.
pub struct TaskHandle<R> {
    rx: mpsc::Receiver<R>,
}

impl<R> TaskHandle<R> {
    /// Blocks until the task finishes and returns its value.
    ///
    /// Fails with [`ServerError::PoolStopped`] if the pool shut down
    /// before the task produced a value.
    pub fn wait(self) -> Result<R, ServerError> {
        self.rx.recv().map_err(|_| ServerError::PoolStopped)
    }
}

/// Fixed-size pool of worker threads consuming a FIFO task queue.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns a pool with `size` workers (at least one).
    pub fn new(size: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(TaskQueue::default()),
            cond: Condvar::new(),
        });
        let workers = (0..size.max(1))
            .map(|i| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("pool-worker-{i}"))
                    .spawn(move || worker_loop(shared))
                    .unwrap_or_else(|e| panic!("failed to spawn pool worker: {e}"))
            })
            .collect();
        Self { shared, workers }
    }

    /// Returns the number of worker threads.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Submits a task and returns a handle to its result.
    pub fn enqueue<R, F>(&self, f: F) -> Result<TaskHandle<R>, ServerError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        {
            let mut queue = self.lock();
            if queue.stopped {
                return Err(ServerError::PoolStopped);
            }
            queue.tasks.push_back(Box::new(move || {
                let _ = tx.send(f());
            }));
        }
        self.shared.cond.notify_one();
        Ok(TaskHandle { rx })
    }

    /// Flags the pool as stopped and wakes all workers. Already-queued
    /// tasks still run; workers exit once the queue is drained.
    pub fn stop(&self) {
        {
            let mut queue = self.lock();
            queue.stopped = true;
        }
        self.shared.cond.notify_all();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TaskQueue> {
        self.shared.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                if let Some(task) = queue.tasks.pop_front() {
                    break task;
                }
                if queue.stopped {
                    return;
                }
                queue = shared
                    .cond
                    .wait(queue)
                    .unwrap_or_else(|e| e.into_inner());
            }
        };
        task();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.workers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_enqueue_and_wait() {
        let pool = WorkerPool::new(1);
        let handle = pool.enqueue(|| 7 * 6).unwrap();
        assert_eq!(handle.wait().unwrap(), 42);
    }

    #[test]
    fn test_default_size_is_one() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_tasks_run_off_caller_thread() {
        let pool = WorkerPool::new(1);
        let caller = thread::current().id();
        let worker = pool.enqueue(|| thread::current().id()).unwrap();
        assert_ne!(worker.wait().unwrap(), caller);
    }

    #[test]
    fn test_single_worker_runs_in_order() {
        let pool = WorkerPool::new(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..5)
            .map(|i| {
                let log = Arc::clone(&log);
                pool.enqueue(move || log.lock().unwrap().push(i)).unwrap()
            })
            .collect();
        for h in handles {
            h.wait().unwrap();
        }
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_enqueue_after_stop_fails() {
        let pool = WorkerPool::new(1);
        pool.stop();
        let result = pool.enqueue(|| ());
        assert!(matches!(result, Err(ServerError::PoolStopped)));
    }

    #[test]
    fn test_queued_tasks_finish_after_stop() {
        let pool = WorkerPool::new(1);
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let counter = Arc::clone(&counter);
                pool.enqueue(move || {
                    thread::sleep(Duration::from_millis(5));
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
            })
            .collect();
        pool.stop();
        for h in handles {
            h.wait().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
