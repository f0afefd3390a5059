// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Type-erased, single-shot continuations, intrusively linked so they can be
//! queued by [`Watch`](crate::watch::Watch) and [`Task`](crate::task::Task)
//! without a separate allocation for list membership.

use linked_list::{Linked, Links};
use std::cell::UnsafeCell;
use std::fmt;
use std::pin::Pin;
use std::ptr::{self, NonNull};

/// A single-shot, type-erased callable accepting `T`.
///
/// `Handler` is constructed once, attached to at most one intrusive list at a
/// time, and consumed by exactly one of [`notify`](Handler::notify) or
/// [`destroy`](HandlerList::destroy_all) over its lifetime.
pub struct Handler<T> {
    links: Links<Handler<T>>,
    // `None` after `notify` has run; list membership guarantees at most one
    // caller ever observes the value.
    f: UnsafeCell<Option<Box<dyn FnOnce(T) + Send>>>,
}

// Safety: `f` is only ever touched by whichever thread holds the unique
// `Box<Handler<T>>` (either because it is about to attach it to a list, or
// because it just detached it); a `Handler` is never observed by two threads
// at once.
unsafe impl<T: Send> Send for Handler<T> {}
unsafe impl<T: Send> Sync for Handler<T> {}

impl<T> fmt::Debug for Handler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler").finish_non_exhaustive()
    }
}

impl<T> Handler<T> {
    #[must_use]
    pub fn new<F>(f: F) -> Box<Self>
    where
        F: FnOnce(T) + Send + 'static,
    {
        Box::new(Handler {
            links: Links::default(),
            f: UnsafeCell::new(Some(Box::new(f))),
        })
    }

    /// Invokes the payload and consumes the handler.
    pub fn notify(self: Box<Self>, arg: T) {
        // Safety: unique ownership of `self` guarantees exclusive access.
        let f = unsafe { (*self.f.get()).take() };
        if let Some(f) = f {
            f(arg);
        }
    }

    /// Drops the handler without invoking its payload.
    pub fn destroy(self: Box<Self>) {
        drop(self);
    }
}

// Safety: `Links` is the first logical field accessed only through
// `Pin`-respecting intrusive-list operations; `Handler` is heap allocated via
// `Box` so it never moves while linked.
unsafe impl<T> Linked for Handler<T> {
    type Handle = Box<Handler<T>>;

    fn into_ptr(handle: Self::Handle) -> NonNull<Self> {
        NonNull::new(Box::into_raw(handle)).expect("Box is never null")
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        // Safety: caller guarantees `ptr` originated from `into_ptr`.
        unsafe { Box::from_raw(ptr.as_ptr()) }
    }

    unsafe fn links(ptr: NonNull<Self>) -> NonNull<Links<Self>> {
        // Safety: `links` is a valid field projection; `Handler` is never
        // moved while pinned in a list.
        unsafe { NonNull::new_unchecked(ptr::addr_of_mut!((*ptr.as_ptr()).links)) }
    }
}

/// An intrusive queue of pending [`Handler`]s.
///
/// `HandlerList` owns every handler attached to it; [`drain`](HandlerList::drain)
/// transfers ownership of all handlers to the caller in FIFO order, which is
/// how [`Watch::close`](crate::watch::Watch::close) and task completion
/// notification hand them off for invocation outside any lock.
pub struct HandlerList<T> {
    list: linked_list::List<Handler<T>>,
}

impl<T> Default for HandlerList<T> {
    fn default() -> Self {
        HandlerList {
            list: linked_list::List::new(),
        }
    }
}

impl<T> fmt::Debug for HandlerList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerList")
            .field("len", &self.list.len())
            .finish()
    }
}

impl<T> HandlerList<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Attaches a handler; the list owns it until drained or removed.
    pub fn push_handler(&mut self, handler: Box<Handler<T>>) {
        self.list.push_back(handler);
    }

    /// Removes and returns every attached handler in FIFO order, leaving the
    /// list empty. Used to notify handlers outside whatever lock protects
    /// the list itself.
    pub fn drain(&mut self) -> Vec<Box<Handler<T>>> {
        let mut out = Vec::with_capacity(self.list.len());
        while let Some(h) = self.list.pop_front() {
            out.push(h);
        }
        out
    }
}

#[allow(dead_code)]
fn _assert_pin_unused<T>(_: Pin<&Handler<T>>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn notify_invokes_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let h = Handler::new(move |v: i32| {
            c.fetch_add(v as usize, Ordering::Relaxed);
        });
        h.notify(5);
        assert_eq!(count.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn destroy_does_not_invoke() {
        let called = Arc::new(AtomicUsize::new(0));
        let c = called.clone();
        let h = Handler::new(move |_: ()| {
            c.fetch_add(1, Ordering::Relaxed);
        });
        h.destroy();
        assert_eq!(called.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn list_drains_in_fifo_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut list = HandlerList::new();
        for i in 0..3 {
            let order = order.clone();
            list.push_handler(Handler::new(move |_: ()| {
                order.lock().unwrap().push(i);
            }));
        }
        assert!(!list.is_empty());
        for h in list.drain() {
            h.notify(());
        }
        assert!(list.is_empty());
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }
}
