// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A user-space, cooperatively scheduled thread of control.
//!
//! A [`Task`] is built directly atop a stackful [`fiber::Fiber`] rather than
//! a [`Future`](std::future::Future): the fiber's suspended execution
//! context *is* the "exactly one of `self`/`scheduler` continuations is
//! live" pair from the source design, collapsed into a single movable
//! object. `await(fn)` suspends the fiber; the task's atomic [`state::State`]
//! bitset tracks why it is suspended and what should happen on the next
//! activation.

mod builder;
mod id;
mod join;
pub(crate) mod state;
mod yield_now;

pub use builder::TaskBuilder;
pub use id::Id;
pub use join::JoinHandle;
pub use yield_now::yield_now;

use crate::executor::Executor;
use crate::handler::{Handler, HandlerList};
use crate::status::Status;
use crate::time::{self, TimerCancelToken};
use fiber::stack::DefaultFiberStack;
use fiber::{Fiber, FiberResult, Suspend};
use state::State;
use std::any::Any;
use std::cell::{Cell, RefCell, UnsafeCell};
use std::collections::VecDeque;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use util::CachePadded;

type TaskFiber = Fiber<(), (), (), (), DefaultFiberStack>;

const DEFAULT_STACK_SIZE: usize = 512 * 1024;
/// Bound on inline (same-thread, same-call-stack) activation chains before
/// an activation is forced through the executor's post queue.
const MAX_DISPATCH_DEPTH: u32 = 8;

thread_local! {
    static CURRENT_TASK: RefCell<Option<TaskRef>> = const { RefCell::new(None) };
    static DISPATCH_DEPTH: Cell<u32> = const { Cell::new(0) };
    static TRAMPOLINE_RUNNING: Cell<bool> = const { Cell::new(false) };
    static TRAMPOLINE_QUEUE: RefCell<VecDeque<TaskRef>> = RefCell::new(VecDeque::new());
}

/// A reference-counted handle to a spawned [`Task`].
///
/// Cloning a `TaskRef` is cheap (an `Arc` bump); the executor holds one
/// while a task is queued, and it is otherwise shared by anything waiting
/// on the task (joiners, wakers).
pub type TaskRef = Arc<Task>;

/// Guards a field behind one of [`Task`]'s state-bitset spin-lock bits,
/// matching the "spin bit instead of a separate lock object" discipline the
/// per-task state word is designed around. Holds only the payload; the bit
/// and the state word it spins on are supplied by the caller, since both
/// live on the same `Task` this lock is a field of.
struct BitLock<T> {
    cell: UnsafeCell<T>,
}

// Safety: access to `cell` is only ever granted inside `with`, which holds
// the CAS-acquired bit for the duration of the closure.
unsafe impl<T: Send> Send for BitLock<T> {}
unsafe impl<T: Send> Sync for BitLock<T> {}

impl<T> BitLock<T> {
    fn new(value: T) -> Self {
        BitLock {
            cell: UnsafeCell::new(value),
        }
    }

    fn with<R>(&self, state: &AtomicU32, bit: u32, f: impl FnOnce(&mut T) -> R) -> R {
        loop {
            let prev = state.fetch_or(bit, Ordering::Acquire);
            if prev & bit == 0 {
                break;
            }
            std::hint::spin_loop();
        }
        // Safety: the CAS loop above gives exclusive access to `cell` until
        // the bit is cleared below.
        let r = f(unsafe { &mut *self.cell.get() });
        state.fetch_and(!bit, Ordering::Release);
        r
    }
}

/// A cooperative thread of control.
///
/// See the module documentation for how this differs from a `Future`-based
/// task.
pub struct Task {
    id: Id,
    name: Option<Box<str>>,
    priority: AtomicI32,
    executor: Arc<dyn Executor>,
    state: CachePadded<AtomicU32>,
    fiber: UnsafeCell<TaskFiber>,
    /// Set exactly once, the first time the fiber begins executing; stable
    /// for the task's lifetime afterwards since the fiber's own stack (and
    /// therefore the `Suspend` it is derived from) never moves.
    suspend_ptr: Cell<Option<NonNull<Suspend<(), ()>>>>,
    sleep_timer: BitLock<Option<TimerCancelToken>>,
    completion_handlers: BitLock<HandlerList<Status>>,
    awaiting_slot: UnsafeCell<Option<Box<dyn Any + Send>>>,
    stack_base: std::num::NonZeroUsize,
    user_fn: UserFnSlot,
    /// Lets methods that need to hand out an owned [`TaskRef`] (to store in
    /// a handler closure, or post to an executor) do so from `&self` alone.
    self_weak: std::sync::Weak<Task>,
}

// Safety: a `Task` is resumed by at most one OS thread at a time, enforced
// by the `SUSPENDED` bit CAS in `activate` (only the thread that wins the
// ready->running transition may touch the fiber or the awaiting slot), and
// every other field is either atomic or behind a `BitLock`.
unsafe impl Send for Task {}
// Safety: see above; shared access (cloning the `Arc`, reading id/name/
// priority, calling `wake`/`call_when_done`) from multiple threads is sound.
unsafe impl Sync for Task {}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Task {
    /// The process-unique id assigned at creation.
    #[must_use]
    pub fn id(&self) -> Id {
        self.id
    }

    /// The human-readable name given at creation, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[must_use]
    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    /// The base address of this task's stack, for stack-position queries
    /// (e.g. guard-page-proximity checks by an embedding host).
    #[must_use]
    pub fn stack_base(&self) -> std::num::NonZeroUsize {
        self.stack_base
    }

    fn is_terminal(&self) -> bool {
        State::from_bits_truncate(self.state.load(Ordering::Acquire)).is_terminal()
    }

    /// Recovers an owned, reference-counted handle to this task.
    ///
    /// # Panics
    ///
    /// Panics if called after the task's own `Arc` has already dropped to
    /// zero, which cannot happen while any of this task's own code (which
    /// is always run through a live `TaskRef`) is executing.
    fn self_ref(&self) -> TaskRef {
        self.self_weak
            .upgrade()
            .expect("Task::self_ref called after the task was dropped")
    }

    /// Suspends the calling task by switching back to the scheduler's
    /// context. Must only be called on this task's own fiber stack, with
    /// `SUSPENDED` already set in `state`.
    fn suspend_point(&self) {
        let suspend = self
            .suspend_ptr
            .get()
            .expect("suspend_point called before the task's fiber has started");
        // Safety: the pointer was derived from a `&Suspend` that lives as
        // long as this task's fiber stack, which outlives the task.
        unsafe { suspend.as_ref() }.suspend(());
    }

    /// Returns the currently running task, if called from within one.
    #[must_use]
    pub fn current() -> Option<TaskRef> {
        CURRENT_TASK.with(|c| c.borrow().clone())
    }

    /// Suspends and reschedules the calling task via its executor; outside
    /// a task, forwards to `std::thread::yield_now`.
    pub fn yield_now_impl() {
        match Self::current() {
            Some(task) => {
                task.state.fetch_or(State::SUSPENDED.bits(), Ordering::AcqRel);
                task.executor.post(task.clone());
                task.suspend_point();
            }
            None => std::thread::yield_now(),
        }
    }

    /// Blocks the task for at least `duration`, unless [`wake`](Task::wake)
    /// cancels it first, in which case `Status::Cancelled` is returned.
    /// Outside a task this is an OS sleep.
    pub fn sleep(duration: Duration) -> Status {
        match Self::current() {
            Some(task) => {
                let deadline = Instant::now() + duration;
                let for_closure = task.clone();
                task.await_fn(move |handler| {
                    let token = time::schedule(deadline, handler);
                    for_closure.sleep_timer.with(
                        &for_closure.state,
                        State::SLEEP_TIMER_LOCK.bits(),
                        |slot| *slot = Some(token),
                    );
                })
            }
            None => {
                std::thread::sleep(duration);
                Status::OK
            }
        }
    }

    /// Cancels a pending `sleep`. Returns `true` iff a cancellation was
    /// actually delivered (idempotent: a second call on an already-fired or
    /// never-sleeping task returns `false`).
    pub fn wake(&self) -> bool {
        let token = self
            .sleep_timer
            .with(&self.state, State::SLEEP_TIMER_LOCK.bits(), std::mem::take);
        match token {
            Some(token) => token.cancel(),
            None => false,
        }
    }

    /// The universal suspension primitive: atomically marks the task as
    /// awaiting a signal, invokes `register` with a one-shot [`Handler`]
    /// that resolves the wait, and suspends until it fires — unless
    /// `register` fires it synchronously, in which case no suspension
    /// happens at all (no missed wakeups either way).
    fn await_fn<R, F>(&self, register: F) -> R
    where
        R: Send + 'static,
        F: FnOnce(Box<Handler<R>>),
    {
        self.state.fetch_or(State::NEED_SIGNAL.bits(), Ordering::AcqRel);

        let task_ref = self.self_ref();
        let handler = Handler::new(move |value: R| {
            // Safety: ownership of the awaiting slot transfers atomically
            // with the HAVE_SIGNAL bit below; only one handler per `await`
            // call ever exists.
            unsafe {
                *task_ref.awaiting_slot.get() = Some(Box::new(value));
            }
            task_ref.state.fetch_or(State::HAVE_SIGNAL.bits(), Ordering::AcqRel);
            activate(task_ref.clone());
        });

        register(handler);

        let have_signal = self.state.load(Ordering::Acquire) & State::HAVE_SIGNAL.bits() != 0;
        if have_signal {
            // `register` invoked the handler synchronously; nothing to
            // suspend for. Clear both flags ourselves since `activate` (the
            // normal clearer) never ran.
            self.state.fetch_and(
                !(State::NEED_SIGNAL.bits() | State::HAVE_SIGNAL.bits()),
                Ordering::AcqRel,
            );
        } else {
            self.state.fetch_or(State::SUSPENDED.bits(), Ordering::AcqRel);

            // A handler firing on another thread between the `have_signal`
            // load above and the `SUSPENDED` flag going up would find
            // `SUSPENDED` still clear, so its `activate()` call's
            // `is_ready()` check fails and the activation is silently
            // dropped -- the missed-wakeup window. Re-check here, now that
            // `SUSPENDED` is visible: if the handler already deposited its
            // value, handle it exactly like the synchronous fast path
            // instead of suspending into a wakeup that will never arrive.
            let have_signal_after_suspend =
                self.state.load(Ordering::Acquire) & State::HAVE_SIGNAL.bits() != 0;
            if have_signal_after_suspend {
                self.state.fetch_and(
                    !(State::NEED_SIGNAL.bits() | State::HAVE_SIGNAL.bits() | State::SUSPENDED.bits()),
                    Ordering::AcqRel,
                );
            } else {
                self.suspend_point();
            }
        }

        // Safety: we only reach here after observing (or having caused)
        // HAVE_SIGNAL, which is exactly when the handler has deposited a
        // value into the slot.
        let boxed = unsafe { (*self.awaiting_slot.get()).take() }
            .expect("await handler did not deposit a value");
        *boxed
            .downcast::<R>()
            .unwrap_or_else(|_| panic!("Task::await_fn type mismatch"))
    }

    /// Invokes `handler` immediately if the task is already terminal,
    /// otherwise queues it to fire once the task reaches its terminal
    /// state.
    pub fn call_when_done(&self, handler: Box<Handler<Status>>) {
        if self.is_terminal() {
            handler.notify(Status::OK);
            return;
        }
        let mut handler = Some(handler);
        let refired = self.completion_handlers.with(
            &self.state,
            State::COMPLETION_HANDLERS_LOCK.bits(),
            |list| {
                if self.state.load(Ordering::Acquire) & State::COMPLETION_HANDLERS_CLOSED.bits() != 0 {
                    handler.take()
                } else {
                    list.push_handler(handler.take().unwrap());
                    None
                }
            },
        );
        if let Some(h) = refired {
            h.notify(Status::OK);
        }
    }

    /// Awaits this task's terminal transition.
    pub fn join(&self) -> Status {
        match Self::current() {
            Some(current) => current.await_fn(|handler| self.call_when_done(handler)),
            None => {
                let pair = Arc::new((Mutex::new(None::<Status>), Condvar::new()));
                let p = pair.clone();
                self.call_when_done(Handler::new(move |s: Status| {
                    *p.0.lock().unwrap() = Some(s);
                    p.1.notify_all();
                }));
                let (lock, cvar) = &*pair;
                let mut guard = lock.lock().unwrap();
                while guard.is_none() {
                    guard = cvar.wait(guard).unwrap();
                }
                guard.take().unwrap()
            }
        }
    }

    fn fire_completion_handlers(&self) {
        let handlers = self.completion_handlers.with(
            &self.state,
            State::COMPLETION_HANDLERS_LOCK.bits(),
            |list| {
                self.state
                    .fetch_or(State::COMPLETION_HANDLERS_CLOSED.bits(), Ordering::AcqRel);
                list.drain()
            },
        );
        for h in handlers {
            h.notify(Status::OK);
        }
    }

    /// Spawns a task on `executor` with default priority and no name; its
    /// result is not tracked (fire-and-forget other than completion
    /// handlers/`join`).
    pub fn spawn_detached<E, F>(executor: Arc<E>, f: F) -> TaskRef
    where
        E: Executor + 'static,
        F: FnOnce() + Send + 'static,
    {
        TaskBuilder::new().spawn(executor, f)
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        assert!(
            self.is_terminal() || !self.fiber.get_mut().started(),
            "destroyed a non-terminal Task {}",
            self.id
        );
    }
}

/// The body every task fiber runs: recovers the owning [`Task`] from the
/// thread-local slot `run_to_suspension` populates before the first resume,
/// captures the `Suspend` handle for later `await`/`yield_now` calls, then
/// runs the user closure deposited at spawn time.
fn fiber_entry(_input: (), suspend: &Suspend<(), ()>, _local: &()) {
    let task = CURRENT_TASK
        .with(|c| c.borrow().clone())
        .expect("task fiber started without CURRENT_TASK set");
    task.suspend_ptr.set(Some(NonNull::from(suspend)));

    // Safety: the user closure is deposited by `TaskBuilder::spawn` before
    // the task is ever activated, and taken exactly once here.
    let f = unsafe { (*task.user_fn_slot()).take() }
        .expect("task fiber started without a user function");

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
    if let Err(payload) = result {
        let msg = panic_message(&payload);
        tracing::error!(task = %task.id, "{msg}");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked with a non-string payload".to_string()
    }
}

/// Per-task slot for the user function, only populated between
/// construction and the first fiber resume.
struct UserFnSlot(UnsafeCell<Option<Box<dyn FnOnce() + Send>>>);
// Safety: see `Task`'s Send/Sync rationale; only touched before the first
// resume (builder) and inside the fiber closure on its first run (task
// itself), which happen-before each other via the state machine.
unsafe impl Send for UserFnSlot {}
unsafe impl Sync for UserFnSlot {}

impl Task {
    fn user_fn_slot(&self) -> *const UnsafeCell<Option<Box<dyn FnOnce() + Send>>> {
        self.user_fn.0.get()
    }
}

/// Lets other modules in this crate (`watch`, `grant`) drive a task through
/// the same suspend/resume primitive `Task::sleep`/`Task::join` use,
/// without exposing `Task::await_fn` itself outside `task::mod`.
pub(crate) fn await_fn_for<T, F>(task: &TaskRef, register: F) -> T
where
    T: Send + 'static,
    F: FnOnce(Box<Handler<T>>),
{
    task.await_fn(register)
}

/// Activates a ready task: clears its suspension flags and asks its
/// executor to run it, either inline (subject to the dispatch-depth bound
/// and the per-thread trampoline) or via the post queue.
pub(crate) fn activate(task: TaskRef) {
    let result = task.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
        let state = State::from_bits_truncate(bits);
        if state.is_ready() {
            Some((state & !(State::SUSPENDED | State::NEED_SIGNAL | State::HAVE_SIGNAL)).bits())
        } else {
            None
        }
    });
    if result.is_err() {
        return;
    }
    let executor = task.executor.clone();
    executor.dispatch(task);
}

/// Runs `task` on the calling OS thread until it next suspends or
/// terminates, driving the per-thread trampoline so at most one task is
/// ever executing on this thread at a time.
pub(crate) fn schedule_local_or(task: TaskRef, executor: &dyn Executor) {
    let depth = DISPATCH_DEPTH.with(Cell::get);
    if depth >= MAX_DISPATCH_DEPTH {
        executor.post(task);
        return;
    }
    if TRAMPOLINE_RUNNING.with(Cell::get) {
        TRAMPOLINE_QUEUE.with(|q| q.borrow_mut().push_back(task));
        return;
    }
    TRAMPOLINE_RUNNING.with(|r| r.set(true));
    run_to_suspension(task);
    loop {
        let next = TRAMPOLINE_QUEUE.with(|q| q.borrow_mut().pop_front());
        match next {
            Some(t) => run_to_suspension(t),
            None => break,
        }
    }
    TRAMPOLINE_RUNNING.with(|r| r.set(false));
}

/// Drives one activation of `task`: resumes its fiber once, handling
/// termination if the user function returns.
pub(crate) fn run_to_suspension(task: TaskRef) {
    CURRENT_TASK.with(|c| *c.borrow_mut() = Some(task.clone()));
    DISPATCH_DEPTH.with(|d| d.set(d.get() + 1));

    // Safety: `activate` guaranteed exclusive access by winning the
    // ready->running CAS before posting/dispatching this task.
    let result = unsafe { &mut *task.fiber.get() }.resume(());

    DISPATCH_DEPTH.with(|d| d.set(d.get() - 1));
    CURRENT_TASK.with(|c| *c.borrow_mut() = None);

    if let FiberResult::Return(()) = result {
        task.state
            .fetch_or((State::SUSPENDED | State::TERMINATED).bits(), Ordering::AcqRel);
        task.fire_completion_handlers();
    }
}
