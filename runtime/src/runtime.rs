// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The process-wide entry point: owns the default worker pool and a bank of
//! "weak-notify" slots used to implement a hash-keyed publish/subscribe that
//! doesn't require a dedicated [`Watch`] per object.
//!
//! CPU pinning itself (the actual OS affinity call) is deliberately out of
//! scope here, matching the "CPU-pinning bootstrap minutiae" this crate
//! treats as an external collaborator; `RuntimeConfig::pin_workers` is
//! recorded and logged but not acted on.

use crate::config::RuntimeConfig;
use crate::executor::{Executor, WorkerPool};
use crate::status::{Status, StatusCode};
use crate::task::TaskRef;
use crate::watch::Watch;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

const SLOTS_PER_WORKER: usize = 1024;

/// Process-wide lifecycle owner: a worker pool plus the weak-notify slot
/// array `notify`/`await_condition` hash into.
pub struct Runtime {
    pool: Arc<WorkerPool>,
    slots: Vec<Watch<u64>>,
    config: RuntimeConfig,
}

impl Runtime {
    /// Spawns the configured worker pool and allocates `worker_count * 1024`
    /// weak-notify slots.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        tracing::info!(
            workers = config.worker_count(),
            pin_requested = config.pin_workers(),
            "starting runtime"
        );
        let pool = WorkerPool::new(config.worker_count(), config.thread_name_prefix());
        let slot_count = config.worker_count() * SLOTS_PER_WORKER;
        let slots = (0..slot_count).map(|_| Watch::new(0u64)).collect();
        Arc::new(Runtime { pool, slots, config })
    }

    /// A `Runtime` with the default config (one worker per detected CPU).
    #[must_use]
    pub fn default_config() -> Arc<Self> {
        Self::new(RuntimeConfig::default())
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[must_use]
    pub fn executor(&self) -> Arc<WorkerPool> {
        self.pool.clone()
    }

    /// Spawns `f` as a detached task and schedules it on this runtime's pool.
    pub fn spawn<F>(&self, f: F) -> TaskRef
    where
        F: FnOnce() + Send + 'static,
    {
        let task = crate::task::Task::spawn_detached(self.pool.clone(), f);
        self.pool.post(task.clone());
        task
    }

    fn slot(&self, keys: &[usize]) -> &Watch<u64> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        keys.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.slots.len();
        &self.slots[idx]
    }

    /// Wakes anyone blocked in `await_condition` on the same `keys`.
    ///
    /// `keys` identifies the logical objects that changed (typically their
    /// addresses cast to `usize`); collisions just cause spurious wakeups,
    /// which `await_condition` callers must tolerate by re-checking `pred`.
    pub fn notify(&self, keys: &[usize]) {
        self.slot(keys).fetch_add(1);
    }

    /// Blocks (cooperatively inside a task, or the calling OS thread outside
    /// one) until `pred` holds, re-checking it on every `notify` that hashes
    /// to the same slot.
    pub fn await_condition(&self, keys: &[usize], mut pred: impl FnMut() -> bool) {
        let slot = self.slot(keys);
        loop {
            if pred() {
                return;
            }
            let last_seen = slot.get_value();
            if pred() {
                return;
            }
            slot.await_not_equal(last_seen);
        }
    }

    /// Stops the worker loops and closes every weak-notify slot, waking any
    /// blocked `await_condition` callers with a closed status. Idempotent.
    pub fn halt(&self) {
        self.pool.halt();
        for slot in &self.slots {
            slot.close(Status::new(StatusCode::Closed));
        }
    }

    /// Joins every worker thread. Idempotent.
    pub fn join(&self) {
        self.pool.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn spawn_runs_on_the_pool() {
        let rt = Runtime::new(RuntimeConfig::builder().worker_count(2).build());
        let flag = Arc::new(AtomicBool::new(false));
        let f = flag.clone();
        let task = rt.spawn(move || f.store(true, Ordering::SeqCst));
        task.join();
        assert!(flag.load(Ordering::SeqCst));
        rt.halt();
        rt.join();
    }

    #[test]
    fn notify_wakes_await_condition() {
        let rt = Runtime::new(RuntimeConfig::builder().worker_count(1).build());
        let key = [0x42usize];
        let ready = Arc::new(AtomicBool::new(false));
        let r = ready.clone();
        let rt_bg = rt.clone();
        let worker = rt.spawn(move || {
            rt_bg.await_condition(&key, || r.load(Ordering::SeqCst));
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        ready.store(true, Ordering::SeqCst);
        rt.notify(&key);
        worker.join();
        rt.halt();
        rt.join();
    }

    #[test]
    fn halt_is_idempotent() {
        let rt = Runtime::new(RuntimeConfig::builder().worker_count(1).build());
        rt.halt();
        rt.halt();
        rt.join();
    }
}
