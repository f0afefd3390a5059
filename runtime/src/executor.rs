// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The executor contract Tasks are scheduled over, and a small worker-pool
//! implementation of it used by the default [`Runtime`](crate::runtime::Runtime).

use crate::task::TaskRef;
use mpsc_queue::MpscQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// A type capable of posting or dispatching nullary callables.
///
/// `dispatch` may run the task inline (on the caller's thread, if that is
/// sound); `post` always hands it to another worker. Both methods take
/// ownership of a [`TaskRef`] rather than an arbitrary closure: the only
/// callable this crate ever schedules is "resume this task".
pub trait Executor: Send + Sync {
    /// Run `task` now if this thread is an eligible worker and the nesting
    /// bound allows it, otherwise equivalent to `post`.
    fn dispatch(&self, task: TaskRef);

    /// Enqueue `task` for execution by some worker thread.
    fn post(&self, task: TaskRef);
}

enum Job {
    Task(TaskRef),
    Shutdown,
}

/// A fixed-size pool of OS worker threads, each running the cooperative
/// task trampoline (see `task/mod.rs`).
pub struct WorkerPool {
    queue: Arc<MpscQueue<QueueNode>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    parked: Arc<(Mutex<()>, Condvar)>,
    queued_len: Arc<AtomicUsize>,
}

struct QueueNode {
    job: std::cell::UnsafeCell<Option<Job>>,
    links: mpsc_queue::Links<QueueNode>,
}

// Safety: a `QueueNode` is only ever dequeued by the single MPSC consumer,
// and enqueued by at most one producer at a time transferring ownership.
unsafe impl Send for QueueNode {}
unsafe impl Sync for QueueNode {}

// Safety: `links` is a plain field projection; nodes are boxed and therefore
// stable in memory while linked.
unsafe impl mpsc_queue::Linked for QueueNode {
    type Handle = Box<QueueNode>;

    fn into_ptr(handle: Self::Handle) -> std::ptr::NonNull<Self> {
        std::ptr::NonNull::new(Box::into_raw(handle)).expect("Box is never null")
    }

    unsafe fn from_ptr(ptr: std::ptr::NonNull<Self>) -> Self::Handle {
        // Safety: caller guarantees `ptr` originated from `into_ptr`.
        unsafe { Box::from_raw(ptr.as_ptr()) }
    }

    unsafe fn links(ptr: std::ptr::NonNull<Self>) -> std::ptr::NonNull<mpsc_queue::Links<Self>> {
        // Safety: `links` is a valid field projection.
        unsafe { std::ptr::NonNull::new_unchecked(std::ptr::addr_of_mut!((*ptr.as_ptr()).links)) }
    }
}

impl WorkerPool {
    /// Spawns `count` worker threads, each named `{prefix}-{index}`.
    #[must_use]
    pub fn new(count: usize, thread_name_prefix: &str) -> Arc<Self> {
        let stub = Box::new(QueueNode {
            job: std::cell::UnsafeCell::new(None),
            links: mpsc_queue::Links::new_stub(),
        });
        let queue = Arc::new(MpscQueue::new_with_stub(stub));
        let parked = Arc::new((Mutex::new(()), Condvar::new()));
        let queued_len = Arc::new(AtomicUsize::new(0));

        let pool = Arc::new(WorkerPool {
            queue: queue.clone(),
            workers: Mutex::new(Vec::with_capacity(count)),
            parked: parked.clone(),
            queued_len: queued_len.clone(),
        });

        let mut workers = Vec::with_capacity(count);
        for idx in 0..count.max(1) {
            let queue = queue.clone();
            let parked = parked.clone();
            let queued_len = queued_len.clone();
            let name = format!("{thread_name_prefix}-{idx}");
            let handle = std::thread::Builder::new()
                .name(name)
                .spawn(move || worker_loop(&queue, &parked, &queued_len))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }
        *pool.workers.lock().unwrap() = workers;
        pool
    }

    fn enqueue(&self, job: Job) {
        let node = Box::new(QueueNode {
            job: std::cell::UnsafeCell::new(Some(job)),
            links: mpsc_queue::Links::new(),
        });
        self.queue.enqueue(node);
        self.queued_len.fetch_add(1, Ordering::Release);
        let (lock, cvar) = &*self.parked;
        let _guard = lock.lock().unwrap();
        cvar.notify_one();
    }

    /// Stops all worker loops after their current job and any already-queued
    /// jobs complete. Idempotent.
    pub fn halt(&self) {
        let n = self.workers.lock().unwrap().len();
        for _ in 0..n {
            self.enqueue(Job::Shutdown);
        }
    }

    /// Joins every worker thread. Idempotent (a second call observes an
    /// already-empty thread list).
    pub fn join(&self) {
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    queue: &MpscQueue<QueueNode>,
    parked: &(Mutex<()>, Condvar),
    queued_len: &AtomicUsize,
) {
    loop {
        match queue.try_dequeue() {
            Ok(node) => {
                queued_len.fetch_sub(1, Ordering::Release);
                // Safety: the consumer side of an MPSC queue has exclusive
                // access to a dequeued node's payload.
                let job = unsafe { (*node.job.get()).take() };
                match job {
                    Some(Job::Task(task)) => crate::task::run_to_suspension(task),
                    Some(Job::Shutdown) | None => return,
                }
            }
            Err(mpsc_queue::TryDequeueError::Empty) => {
                let (lock, cvar) = parked;
                let guard = lock.lock().unwrap();
                if queued_len.load(Ordering::Acquire) == 0 {
                    let _ = cvar
                        .wait_timeout(guard, std::time::Duration::from_millis(50))
                        .unwrap();
                }
            }
            Err(mpsc_queue::TryDequeueError::Busy) => std::hint::spin_loop(),
            Err(mpsc_queue::TryDequeueError::Inconsistent) => std::hint::spin_loop(),
        }
    }
}

impl Executor for WorkerPool {
    fn dispatch(&self, task: TaskRef) {
        crate::task::schedule_local_or(task, self);
    }

    fn post(&self, task: TaskRef) {
        self.enqueue(Job::Task(task));
    }
}

/// Wraps a [`WorkerPool`] (or any [`Executor`]) to offer `async_run`, joining
/// outstanding work when the context is dropped.
pub struct WorkContext<E: Executor> {
    executor: Arc<E>,
    outstanding: Arc<AtomicUsize>,
    idle: Arc<(Mutex<()>, Condvar)>,
}

impl<E: Executor + 'static> WorkContext<E> {
    #[must_use]
    pub fn new(executor: Arc<E>) -> Self {
        WorkContext {
            executor,
            outstanding: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new((Mutex::new(()), Condvar::new())),
        }
    }

    /// Schedules `f` to run on a worker, tracked so a [`ScopedWorkContext`]
    /// can join it.
    pub fn async_run<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        let outstanding = self.outstanding.clone();
        let idle = self.idle.clone();
        let task = crate::task::Task::spawn_detached(self.executor.clone(), move || {
            f();
            if outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
                let (lock, cvar) = &*idle;
                let _guard = lock.lock().unwrap();
                cvar.notify_all();
            }
        });
        self.executor.post(task);
    }

    fn join_outstanding(&self) {
        let (lock, cvar) = &*self.idle;
        let mut guard = lock.lock().unwrap();
        while self.outstanding.load(Ordering::Acquire) != 0 {
            guard = cvar.wait(guard).unwrap();
        }
    }
}

/// A [`WorkContext`] that joins all outstanding `async_run` work when dropped.
pub struct ScopedWorkContext<E: Executor + 'static> {
    inner: WorkContext<E>,
}

impl<E: Executor + 'static> ScopedWorkContext<E> {
    #[must_use]
    pub fn new(executor: Arc<E>) -> Self {
        ScopedWorkContext {
            inner: WorkContext::new(executor),
        }
    }

    pub fn async_run<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.async_run(f);
    }
}

impl<E: Executor + 'static> Drop for ScopedWorkContext<E> {
    fn drop(&mut self) {
        self.inner.join_outstanding();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn worker_pool_runs_and_halts() {
        let pool = WorkerPool::new(2, "test-worker");
        let flag = Arc::new(AtomicBool::new(false));
        let f = flag.clone();
        let task = crate::task::Task::spawn_detached(pool.clone(), move || {
            f.store(true, Ordering::SeqCst);
        });
        pool.post(task);
        // Give the worker a moment; in real tests we'd join a handle.
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(flag.load(Ordering::SeqCst));
        pool.halt();
        pool.join();
    }
}
