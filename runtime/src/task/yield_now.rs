// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::Task;

/// Cooperatively yields the calling task back to its executor, to be
/// rescheduled at the back of the run queue. Outside a task this forwards
/// to [`std::thread::yield_now`].
pub fn yield_now() {
    Task::yield_now_impl();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Executor, WorkerPool};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn yields_without_a_current_task() {
        // Outside any task this is just std::thread::yield_now; mostly a
        // smoke test that it doesn't panic.
        yield_now();
    }

    #[test]
    fn task_can_yield_and_resume() {
        let pool = WorkerPool::new(1, "yield-test");
        let steps = Arc::new(AtomicUsize::new(0));
        let s = steps.clone();
        let task = Task::spawn_detached(pool.clone(), move || {
            s.fetch_add(1, Ordering::SeqCst);
            yield_now();
            s.fetch_add(1, Ordering::SeqCst);
        });
        pool.post(task.clone());
        task.join();
        assert_eq!(steps.load(Ordering::SeqCst), 2);
        pool.halt();
        pool.join();
    }
}
