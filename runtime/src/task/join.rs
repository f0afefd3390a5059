// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A thin, owned handle to a spawned task, for callers that would rather
//! hold a typed value than reach for [`Task::join`](super::Task::join)
//! directly on a [`TaskRef`](super::TaskRef).

use super::TaskRef;
use crate::status::Status;

/// An owned handle to a running or completed task.
///
/// Dropping a `JoinHandle` does not cancel or detach the task; it keeps
/// running regardless; this is purely a reference to observe completion.
pub struct JoinHandle {
    task: TaskRef,
}

impl JoinHandle {
    pub(crate) fn new(task: TaskRef) -> Self {
        JoinHandle { task }
    }

    /// Blocks (cooperatively, if called from within another task) until the
    /// underlying task reaches its terminal state.
    pub fn join(&self) -> Status {
        self.task.join()
    }

    /// The id of the underlying task.
    #[must_use]
    pub fn id(&self) -> super::Id {
        self.task.id()
    }

    /// A clone of the underlying task reference.
    #[must_use]
    pub fn task(&self) -> TaskRef {
        self.task.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Executor, WorkerPool};
    use crate::status::StatusCode;
    use crate::task::Task;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn join_observes_completion() {
        let pool = WorkerPool::new(1, "join-test");
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        let task = Task::spawn_detached(pool.clone(), move || {
            r.store(true, Ordering::SeqCst);
        });
        pool.post(task.clone());
        let handle = JoinHandle::new(task);
        let status = handle.join();
        assert_eq!(status.code(), StatusCode::Ok);
        assert!(ran.load(Ordering::SeqCst));
        pool.halt();
        pool.join();
    }
}
