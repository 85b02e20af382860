// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Single-consumer serial executor.
//!
//! The optimizer and the user controller callback must only ever observe a
//! single thread of execution. [`SerialExecutor`] funnels both onto the
//! thread that called [`SerialExecutor::run`]: submitters from any RPC
//! thread call [`SerialExecutor::exec`], which enqueues a closure, blocks
//! until the consumer thread has run it, and returns its value. Ownership
//! of the submitted data moves into the closure and back out through the
//! return value, so nothing is shared between the two threads while the
//! closure runs.
//!
//! Shutdown is a poison entry: jobs queued before it still run, then the
//! consumer exits. `exec` after `stop` fails with
//! [`ServerError::ExecutorStopped`].
//!
//! Calling `exec` or `stop` from the consumer thread itself would
//! self-deadlock; all submitters are RPC threads.

use crate::ServerError;
use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Block {
    /// A closure that signals its own completion channel when done.
    Job(Job),
    /// Exit marker; the sender is signalled once all predecessors ran.
    Poison(mpsc::Sender<()>),
}

#[derive(Default)]
struct Queue {
    blocks: VecDeque<Block>,
    stopping: bool,
}

/// FIFO executor with one consumer thread and blocking submission.
#[derive(Clone)]
pub struct SerialExecutor {
    shared: Arc<Shared>,
}

struct Shared {
    queue: Mutex<Queue>,
    cond: Condvar,
}

impl Default for SerialExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialExecutor {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue::default()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Consumes jobs on the calling thread until poisoned.
    ///
    /// The thread that calls `run` becomes the single thread all
    /// [`exec`](Self::exec) closures observe.
    pub fn run(&self) {
        loop {
            let block = {
                let mut queue = self.lock();
                loop {
                    if let Some(block) = queue.blocks.pop_front() {
                        break block;
                    }
                    queue = self
                        .shared
                        .cond
                        .wait(queue)
                        .unwrap_or_else(|e| e.into_inner());
                }
            };
            match block {
                Block::Job(job) => job(),
                Block::Poison(done) => {
                    let _ = done.send(());
                    break;
                }
            }
        }
    }

    /// Runs `f` on the consumer thread and returns its value.
    ///
    /// Blocks the calling thread until the closure has completed. Safe to
    /// call concurrently from any number of RPC threads; submissions run
    /// in FIFO order.
    ///
    /// # Panics
    /// Panics if the consumer thread died with a pending submission: a
    /// panicking optimizer or controller leaves the store in an unknown
    /// state, which is fatal to the server process.
    pub fn exec<R, F>(&self, f: F) -> Result<R, ServerError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        {
            let mut queue = self.lock();
            if queue.stopping {
                return Err(ServerError::ExecutorStopped);
            }
            queue.blocks.push_back(Block::Job(Box::new(move || {
                let _ = tx.send(f());
            })));
            self.shared.cond.notify_one();
        }
        match rx.recv() {
            Ok(value) => Ok(value),
            Err(_) => panic!("serial executor thread terminated with a submission in flight"),
        }
    }

    /// Poisons the queue and waits until the consumer thread has drained
    /// all earlier submissions and exited. Idempotent.
    pub fn stop(&self) {
        let (tx, rx) = mpsc::channel();
        {
            let mut queue = self.lock();
            if queue.stopping {
                return;
            }
            queue.stopping = true;
            queue.blocks.push_back(Block::Poison(tx));
            self.shared.cond.notify_one();
        }
        let _ = rx.recv();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Queue> {
        self.shared.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn start(exec: &SerialExecutor) -> thread::JoinHandle<()> {
        let exec = exec.clone();
        thread::spawn(move || exec.run())
    }

    #[test]
    fn test_exec_returns_value() {
        let exec = SerialExecutor::new();
        let consumer = start(&exec);

        let v = exec.exec(|| 21 * 2).unwrap();
        assert_eq!(v, 42);

        exec.stop();
        consumer.join().unwrap();
    }

    #[test]
    fn test_all_jobs_run_on_consumer_thread() {
        let exec = SerialExecutor::new();
        let consumer = start(&exec);
        // The closure must report the consumer's id, not ours.
        let ours = thread::current().id();
        let theirs = exec.exec(|| thread::current().id()).unwrap();
        assert_ne!(ours, theirs);

        exec.stop();
        consumer.join().unwrap();
    }

    #[test]
    fn test_fifo_order() {
        let exec = SerialExecutor::new();
        let consumer = start(&exec);

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut submitters = Vec::new();
        for i in 0..4 {
            let exec = exec.clone();
            let log = Arc::clone(&log);
            submitters.push(thread::spawn(move || {
                exec.exec(move || log.lock().unwrap().push(i)).unwrap();
            }));
        }
        for s in submitters {
            s.join().unwrap();
        }
        assert_eq!(log.lock().unwrap().len(), 4);

        exec.stop();
        consumer.join().unwrap();
    }

    #[test]
    fn test_jobs_queued_before_run_still_execute() {
        let exec = SerialExecutor::new();
        let counter = Arc::new(AtomicUsize::new(0));

        // Queue a job before the consumer even starts.
        let submitter = {
            let exec = exec.clone();
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                exec.exec(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
            })
        };

        thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::SeqCst), 0, "nothing runs before run()");

        let consumer = start(&exec);
        submitter.join().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        exec.stop();
        consumer.join().unwrap();
    }

    #[test]
    fn test_stop_runs_predecessors() {
        let exec = SerialExecutor::new();
        let consumer = start(&exec);
        let counter = Arc::new(AtomicUsize::new(0));

        let submitted: Vec<_> = (0..3)
            .map(|_| {
                let exec = exec.clone();
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    exec.exec(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap()
                })
            })
            .collect();
        for s in submitted {
            s.join().unwrap();
        }

        exec.stop();
        consumer.join().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_exec_after_stop_fails() {
        let exec = SerialExecutor::new();
        let consumer = start(&exec);
        exec.stop();
        consumer.join().unwrap();

        let result = exec.exec(|| ());
        assert!(matches!(result, Err(ServerError::ExecutorStopped)));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let exec = SerialExecutor::new();
        let consumer = start(&exec);
        exec.stop();
        exec.stop();
        exec.stop();
        consumer.join().unwrap();
    }
}
