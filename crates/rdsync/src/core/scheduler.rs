// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Binding-thread schedulers.
//!
//! Each protocol owns one [`Scheduler`]; entity state changes happen on it
//! and inbound frames hop onto it through the dispatch helper.
//!
//! | Scheduler | Thread | Use |
//! |-----------|--------|-----|
//! | [`SynchronousScheduler`] | caller | free-threaded setups, tools |
//! | [`SequentialScheduler`] | dedicated worker | production endpoints |
//! | [`TestScheduler`] | creator, pumped by `flush` | deterministic tests |

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// Unit of scheduled work.
pub type Job = Box<dyn FnOnce() + Send>;

/// Executes work on a logical binding thread.
pub trait Scheduler: Send + Sync {
    /// Enqueue `action` for later execution.
    fn queue(&self, action: Job);

    /// True when the current thread is this scheduler's thread.
    fn is_active(&self) -> bool;

    /// Run queued work. From the scheduler's own thread this drains the
    /// queue reentrantly; from elsewhere it waits until the queue is drained.
    fn flush(&self);

    /// Human-readable name for diagnostics.
    fn name(&self) -> &str;

    /// Panics when called off the scheduler thread.
    fn assert_thread(&self, what: &dyn std::fmt::Display) {
        if !self.is_active() {
            panic!(
                "illegal scheduler for current action `{}`: must be `{}`, was thread {:?}",
                what,
                self.name(),
                thread::current().name().unwrap_or("<unnamed>")
            );
        }
    }

    /// Run `action` inline when already on the scheduler thread.
    fn invoke_or_queue(&self, action: Job) {
        if self.is_active() {
            action();
        } else {
            self.queue(action);
        }
    }
}

fn run_job(scheduler: &str, job: Job) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        log::error!("job on scheduler `{}` panicked: {}", scheduler, message);
    }
}

// ============================================================================
// SynchronousScheduler
// ============================================================================

/// Runs everything inline on the calling thread.
#[derive(Debug, Default)]
pub struct SynchronousScheduler;

impl Scheduler for SynchronousScheduler {
    fn queue(&self, action: Job) {
        action();
    }

    fn is_active(&self) -> bool {
        true
    }

    fn flush(&self) {}

    fn name(&self) -> &str {
        "synchronous"
    }
}

// ============================================================================
// TestScheduler
// ============================================================================

/// Manual queue owned by the thread that created it.
///
/// Nothing runs until that thread calls [`flush`](Scheduler::flush), which
/// makes two-peer interleavings reproducible.
pub struct TestScheduler {
    name: String,
    owner: ThreadId,
    queue: Mutex<VecDeque<Job>>,
}

impl TestScheduler {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            owner: thread::current().id(),
            queue: Mutex::new(VecDeque::new()),
        })
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

impl Scheduler for TestScheduler {
    fn queue(&self, action: Job) {
        self.queue.lock().push_back(action);
    }

    fn is_active(&self) -> bool {
        thread::current().id() == self.owner
    }

    fn flush(&self) {
        if !self.is_active() {
            log::warn!(
                "flush of test scheduler `{}` from a foreign thread ignored",
                self.name
            );
            return;
        }
        loop {
            let job = self.queue.lock().pop_front();
            match job {
                Some(job) => run_job(&self.name, job),
                None => break,
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// SequentialScheduler
// ============================================================================

/// Single worker thread fed by an unbounded channel.
pub struct SequentialScheduler {
    name: String,
    tx: Sender<Job>,
    rx: Receiver<Job>,
    worker: ThreadId,
}

impl SequentialScheduler {
    pub fn new(name: impl Into<String>) -> std::io::Result<Arc<Self>> {
        let name = name.into();
        let (tx, rx) = unbounded::<Job>();
        let worker_rx = rx.clone();
        let worker_name = name.clone();
        let handle = thread::Builder::new()
            .name(format!("rdsync-{}", name))
            .spawn(move || {
                for job in worker_rx.iter() {
                    run_job(&worker_name, job);
                }
                log::debug!("scheduler `{}` worker exited", worker_name);
            })?;
        let worker = handle.thread().id();
        Ok(Arc::new(Self {
            name,
            tx,
            rx,
            worker,
        }))
    }
}

impl Scheduler for SequentialScheduler {
    fn queue(&self, action: Job) {
        if self.tx.send(action).is_err() {
            log::warn!("scheduler `{}` is shut down, job dropped", self.name);
        }
    }

    fn is_active(&self) -> bool {
        thread::current().id() == self.worker
    }

    fn flush(&self) {
        if self.is_active() {
            while let Ok(job) = self.rx.try_recv() {
                run_job(&self.name, job);
            }
        } else {
            let (done_tx, done_rx) = bounded::<()>(1);
            self.queue(Box::new(move || {
                let _ = done_tx.send(());
            }));
            let _ = done_rx.recv();
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
