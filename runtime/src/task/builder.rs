// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Builder for configuring and spawning a [`Task`].

use super::state::State;
use super::{BitLock, Id, Task, TaskRef, UserFnSlot};
use crate::executor::Executor;
use crate::handler::HandlerList;
use fiber::stack::FiberStack;
use fiber::Fiber;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI32, AtomicU32};
use std::sync::Arc;
use util::CachePadded;

/// Configures a task's name, priority and stack size before spawning it.
#[derive(Default)]
pub struct TaskBuilder {
    name: Option<String>,
    priority: i32,
    stack_size: Option<usize>,
}

impl TaskBuilder {
    #[must_use]
    pub fn new() -> Self {
        TaskBuilder {
            name: None,
            priority: 0,
            stack_size: None,
        }
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Builds and immediately dispatches the task onto `executor`; the task
    /// starts suspended (ready, not yet activated) until the caller (or
    /// some other activation path) brings it to the running state.
    pub fn spawn<E, F>(self, executor: Arc<E>, f: F) -> TaskRef
    where
        E: Executor + 'static,
        F: FnOnce() + Send + 'static,
    {
        let id = Id::next();
        let stack_size = self.stack_size.unwrap_or(super::DEFAULT_STACK_SIZE);
        let stack = fiber::stack::DefaultFiberStack::new(stack_size)
            .expect("failed to allocate task stack");
        let stack_base = stack.bottom();

        let fiber = Fiber::with_stack(stack, super::fiber_entry);

        Arc::new_cyclic(|self_weak| Task {
            id,
            name: self.name.map(String::into_boxed_str),
            priority: AtomicI32::new(self.priority),
            executor,
            state: CachePadded::from(AtomicU32::new(State::INITIAL.bits())),
            fiber: UnsafeCell::new(fiber),
            suspend_ptr: std::cell::Cell::new(None),
            sleep_timer: BitLock::new(None),
            completion_handlers: BitLock::new(HandlerList::new()),
            awaiting_slot: UnsafeCell::new(None),
            stack_base,
            user_fn: UserFnSlot(UnsafeCell::new(Some(Box::new(f)))),
            self_weak: self_weak.clone(),
        })
    }
}
