// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The timer contract [`Task::sleep`](crate::task::Task::sleep) consumes,
//! and a minimal background-thread implementation of it.
//!
//! A real embedding would plug in its own I/O-context timer wheel; this
//! module supplies the one the default [`Runtime`](crate::runtime::Runtime)
//! uses so the crate is runnable standalone.

use crate::handler::Handler;
use crate::status::{Status, StatusCode};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

/// A handle that can cancel a previously scheduled timer entry.
///
/// Cancelling after the entry has already fired is a harmless no-op: the
/// entry's slot can only be taken once.
pub struct TimerCancelToken {
    slot: std::sync::Arc<Mutex<Option<Box<Handler<Status>>>>>,
}

impl TimerCancelToken {
    /// Cancels the timer if it has not yet fired, invoking its handler with
    /// [`StatusCode::Cancelled`]. Returns `true` if this call was the one
    /// that fired the handler.
    pub fn cancel(&self) -> bool {
        if let Some(h) = self.slot.lock().unwrap().take() {
            h.notify(Status::new(StatusCode::Cancelled));
            true
        } else {
            false
        }
    }
}

struct Entry {
    deadline: Instant,
    seq: u64,
    slot: std::sync::Arc<Mutex<Option<Box<Handler<Status>>>>>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline).then(self.seq.cmp(&other.seq))
    }
}

struct Wheel {
    heap: Mutex<BinaryHeap<Reverse<Entry>>>,
    notify: Condvar,
}

fn wheel() -> &'static Wheel {
    static WHEEL: OnceLock<&'static Wheel> = OnceLock::new();
    WHEEL.get_or_init(|| {
        let w: &'static Wheel = Box::leak(Box::new(Wheel {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Condvar::new(),
        }));
        std::thread::Builder::new()
            .name("timer-wheel".into())
            .spawn(move || timer_thread(w))
            .expect("failed to spawn timer thread");
        w
    })
}

fn timer_thread(w: &'static Wheel) {
    loop {
        let mut heap = w.heap.lock().unwrap();
        let now = Instant::now();
        while let Some(Reverse(top)) = heap.peek() {
            if top.deadline > now {
                break;
            }
            let Reverse(entry) = heap.pop().unwrap();
            if let Some(h) = entry.slot.lock().unwrap().take() {
                h.notify(Status::OK);
            }
        }
        let wait_for = heap
            .peek()
            .map(|Reverse(e)| e.deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::from_secs(60));
        let _ = w.notify.wait_timeout(heap, wait_for).unwrap();
    }
}

/// Schedules `handler` to fire with [`StatusCode::Ok`] at `deadline`, or
/// earlier with [`StatusCode::Cancelled`] if the returned token is cancelled
/// first.
pub(crate) fn schedule(deadline: Instant, handler: Box<Handler<Status>>) -> TimerCancelToken {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let slot = std::sync::Arc::new(Mutex::new(Some(handler)));
    let w = wheel();
    {
        let mut heap = w.heap.lock().unwrap();
        heap.push(Reverse(Entry {
            deadline,
            seq: SEQ.fetch_add(1, Ordering::Relaxed),
            slot: slot.clone(),
        }));
    }
    w.notify.notify_one();
    TimerCancelToken { slot }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn fires_after_deadline() {
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        let _token = schedule(
            Instant::now() + Duration::from_millis(10),
            Handler::new(move |_| f.store(true, Ordering::SeqCst)),
        );
        std::thread::sleep(Duration::from_millis(100));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_before_fire_delivers_cancelled() {
        let got = Arc::new(Mutex::new(None));
        let g = got.clone();
        let token = schedule(
            Instant::now() + Duration::from_secs(10),
            Handler::new(move |s: Status| *g.lock().unwrap() = Some(s.code())),
        );
        assert!(token.cancel());
        assert_eq!(*got.lock().unwrap(), Some(StatusCode::Cancelled));
        assert!(!token.cancel());
    }
}
