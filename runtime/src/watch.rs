// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An atomically observable value cell — the universal wait primitive
//! [`Grant`](crate::grant::Grant) and the process-wide
//! [`Runtime`](crate::runtime::Runtime) are built on top of.

use crate::handler::{Handler, HandlerList};
use crate::status::{Status, StatusCode};
use crate::task::Task;
use rt_spin::Mutex as SpinMutex;
use std::fmt;

/// The result delivered to a [`Watch`] observer: either a fresh value or the
/// status the watch was closed with.
#[derive(Clone)]
pub enum Observed<T> {
    Value(T),
    Closed(Status),
}

impl<T> Observed<T> {
    /// Unwraps a fresh value, or converts a closed status into an error.
    pub fn into_result(self) -> Result<T, Status> {
        match self {
            Observed::Value(v) => Ok(v),
            Observed::Closed(s) => Err(s),
        }
    }
}

struct Inner<T> {
    value: T,
    observers: HandlerList<Observed<T>>,
    closed: Option<Status>,
}

/// An atomic value cell with asynchronous change notification.
///
/// Every mutating operation that actually changes the value (or closes the
/// watch) wakes every currently attached observer exactly once; observers
/// that attach after a change only see the value from that point on.
pub struct Watch<T> {
    inner: SpinMutex<Inner<T>>,
}

impl<T: fmt::Debug> fmt::Debug for Watch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Watch")
            .field("value", &inner.value)
            .field("closed", &inner.closed.is_some())
            .finish()
    }
}

impl<T: Clone + PartialEq + Send + 'static> Watch<T> {
    #[must_use]
    pub fn new(initial: T) -> Self {
        Watch {
            inner: SpinMutex::new(Inner {
                value: initial,
                observers: HandlerList::new(),
                closed: None,
            }),
        }
    }

    #[must_use]
    pub fn get_value(&self) -> T {
        self.inner.lock().value.clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed.is_some()
    }

    /// Replaces the value; observers are woken only if it actually changed.
    pub fn set_value(&self, value: T) {
        self.modify(|_| value.clone());
    }

    /// Applies `f` to the current value, stores the result, and returns the
    /// *old* value. Observers are woken only if the value actually changed.
    pub fn modify(&self, f: impl FnOnce(&T) -> T) -> T {
        let (old, handlers) = {
            let mut inner = self.inner.lock();
            let old = inner.value.clone();
            let new = f(&inner.value);
            let changed = new != inner.value;
            inner.value = new.clone();
            let handlers = if changed && inner.closed.is_none() {
                inner.observers.drain()
            } else {
                Vec::new()
            };
            (old, handlers)
        };
        for h in handlers {
            h.notify(Observed::Value(self.get_value()));
        }
        old
    }

    /// Retries a compare-and-swap style update: `f` may return `None` to
    /// abandon without notifying, or `Some(new)` to commit it.
    pub fn modify_if(&self, mut f: impl FnMut(&T) -> Option<T>) -> Option<T> {
        let (old, new, handlers) = {
            let mut inner = self.inner.lock();
            let old = inner.value.clone();
            let new = f(&inner.value)?;
            let changed = new != inner.value;
            inner.value = new.clone();
            let handlers = if changed && inner.closed.is_none() {
                inner.observers.drain()
            } else {
                Vec::new()
            };
            (old, new, handlers)
        };
        let _ = &old;
        for h in handlers {
            h.notify(Observed::Value(new.clone()));
        }
        Some(new)
    }

    /// Registers `handler` to fire once with the watch's current value if it
    /// differs from `last_seen`, or immediately with a closed status if the
    /// watch is already closed; otherwise attaches it to the observer list.
    ///
    /// The differs-check and the push onto the observer list happen under
    /// the same lock acquisition, so a concurrent mutation cannot land
    /// between them and lose the notification.
    pub fn async_wait(&self, last_seen: &T, handler: Box<Handler<Observed<T>>>) {
        let outcome = {
            let mut inner = self.inner.lock();
            if let Some(status) = &inner.closed {
                Observed::Closed(status.clone())
            } else if inner.value != *last_seen {
                Observed::Value(inner.value.clone())
            } else {
                inner.observers.push_handler(handler);
                return;
            }
        };
        handler.notify(outcome);
    }

    fn await_fn_sync(&self, last_seen: T) -> Observed<T> {
        match Task::current() {
            Some(task) => task_await_watch(&task, self, last_seen),
            None => blocking_await_watch(self, last_seen),
        }
    }

    /// Blocks until the value differs from `last_seen`, or the watch closes.
    pub fn await_not_equal(&self, last_seen: T) -> Observed<T> {
        self.await_fn_sync(last_seen)
    }

    /// Blocks until `pred` holds for the current value, or the watch closes.
    pub fn await_true(&self, mut pred: impl FnMut(&T) -> bool) -> Observed<T> {
        let mut last_seen = self.get_value();
        loop {
            if pred(&last_seen) {
                return Observed::Value(last_seen);
            }
            match self.await_not_equal(last_seen) {
                Observed::Value(v) => last_seen = v,
                closed @ Observed::Closed(_) => return closed,
            }
        }
    }

    /// Blocks until the value equals `target`, or the watch closes.
    pub fn await_equal(&self, target: T) -> Observed<T> {
        self.await_true(|v| *v == target)
    }

    /// Like [`modify_if`](Watch::modify_if), but when `f` yields `None`
    /// blocks for the next value change and retries, until `f` succeeds or
    /// the watch closes.
    pub fn await_modify(&self, mut f: impl FnMut(&T) -> Option<T>) -> Observed<T> {
        loop {
            let mut last_seen = self.get_value();
            if let Some(new) = self.modify_if(|v| f(v)) {
                return Observed::Value(new);
            }
            match self.await_not_equal(std::mem::replace(&mut last_seen, self.get_value())) {
                Observed::Value(_) => continue,
                closed @ Observed::Closed(_) => return closed,
            }
        }
    }

    /// Replaces the value only if `new > current` under `Ord`.
    pub fn clamp_min_value(&self, new: T)
    where
        T: PartialOrd,
    {
        self.modify_if(|cur| if new > *cur { Some(new.clone()) } else { None });
    }

    /// Replaces the value only if `new < current` under `Ord`.
    pub fn clamp_max_value(&self, new: T)
    where
        T: PartialOrd,
    {
        self.modify_if(|cur| if new < *cur { Some(new.clone()) } else { None });
    }

    /// Latches the watch closed with `status`, delivering it to every
    /// currently attached observer; subsequent `async_wait` calls complete
    /// immediately with the same status.
    pub fn close(&self, status: Status) {
        let handlers = {
            let mut inner = self.inner.lock();
            if inner.closed.is_some() {
                return;
            }
            inner.closed = Some(status.clone());
            inner.observers.drain()
        };
        for h in handlers {
            h.notify(Observed::Closed(status.clone()));
        }
    }
}

impl<T: Clone + PartialEq + Send + std::ops::Add<Output = T> + 'static> Watch<T> {
    pub fn fetch_add(&self, delta: T) -> T {
        self.modify(|v| v.clone() + delta.clone())
    }
}

impl<T: Clone + PartialEq + Send + std::ops::Sub<Output = T> + 'static> Watch<T> {
    pub fn fetch_sub(&self, delta: T) -> T {
        self.modify(|v| v.clone() - delta.clone())
    }
}

impl<T: Clone + PartialEq + Send + std::ops::BitOr<Output = T> + 'static> Watch<T> {
    pub fn fetch_or(&self, bits: T) -> T {
        self.modify(|v| v.clone() | bits.clone())
    }
}

impl<T: Clone + PartialEq + Send + std::ops::BitAnd<Output = T> + 'static> Watch<T> {
    pub fn fetch_and(&self, bits: T) -> T {
        self.modify(|v| v.clone() & bits.clone())
    }
}

fn task_await_watch<T: Clone + PartialEq + Send + 'static>(
    task: &std::sync::Arc<Task>,
    watch: &Watch<T>,
    last_seen: T,
) -> Observed<T> {
    crate::task::await_fn_for(task, |handler| watch.async_wait(&last_seen, handler))
}

fn blocking_await_watch<T: Clone + PartialEq + Send + 'static>(
    watch: &Watch<T>,
    last_seen: T,
) -> Observed<T> {
    use std::sync::{Arc, Condvar, Mutex};
    let pair = Arc::new((Mutex::new(None::<Observed<T>>), Condvar::new()));
    let p = pair.clone();
    watch.async_wait(
        &last_seen,
        Handler::new(move |v: Observed<T>| {
            *p.0.lock().unwrap() = Some(v);
            p.1.notify_all();
        }),
    );
    let (lock, cvar) = &*pair;
    let mut guard = lock.lock().unwrap();
    while guard.is_none() {
        guard = cvar.wait(guard).unwrap();
    }
    guard.take().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_value_no_change_does_not_notify() {
        let w = Watch::new(5i32);
        let notified = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let n = notified.clone();
        w.async_wait(
            &5,
            Handler::new(move |_: Observed<i32>| n.store(true, std::sync::atomic::Ordering::SeqCst)),
        );
        w.set_value(5);
        assert!(!notified.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn modify_returns_old_value() {
        let w = Watch::new(10i32);
        let old = w.modify(|v| v + 1);
        assert_eq!(old, 10);
        assert_eq!(w.get_value(), 11);
    }

    #[test]
    fn close_notifies_with_closed_status() {
        let w: Watch<i32> = Watch::new(0);
        let got = std::sync::Arc::new(std::sync::Mutex::new(None));
        let g = got.clone();
        w.async_wait(
            &0,
            Handler::new(move |v: Observed<i32>| *g.lock().unwrap() = Some(matches!(v, Observed::Closed(_)))),
        );
        w.close(Status::new(StatusCode::Closed));
        assert_eq!(*got.lock().unwrap(), Some(true));
        assert!(w.is_closed());
    }

    #[test]
    fn async_wait_on_closed_watch_fires_immediately() {
        let w: Watch<i32> = Watch::new(0);
        w.close(Status::new(StatusCode::EndOfStream));
        let got = std::sync::Arc::new(std::sync::Mutex::new(None));
        let g = got.clone();
        w.async_wait(
            &0,
            Handler::new(move |v: Observed<i32>| {
                if let Observed::Closed(s) = v {
                    *g.lock().unwrap() = Some(s.code());
                }
            }),
        );
        assert_eq!(*got.lock().unwrap(), Some(StatusCode::EndOfStream));
    }

    #[test]
    fn clamp_min_value_only_increases() {
        let w = Watch::new(5i32);
        w.clamp_min_value(3);
        assert_eq!(w.get_value(), 5);
        w.clamp_min_value(8);
        assert_eq!(w.get_value(), 8);
    }

    #[test]
    fn fetch_add_accumulates() {
        let w = Watch::new(0i64);
        for _ in 0..100 {
            w.fetch_add(1);
        }
        assert_eq!(w.get_value(), 100);
    }
}
