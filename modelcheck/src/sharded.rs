// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Parallel, sharded exploration: the state space is partitioned by
//! `hash(snapshot) % shard_count`, each shard runs the exhaustive BFS against
//! its own local frontier, and cross-shard branches are handed off through a
//! mailbox per shard.
//!
//! Termination uses a two-phase quiescence handshake rather than the
//! sleep-based mitigation of the scheme this is grounded on: a shard only
//! declares itself done after observing the shared pending-work counter at
//! zero *and* a short follow-up `recv_timeout` on its mailbox turns up
//! nothing, closing the narrow race where a sibling's batch is in flight at
//! the exact moment the counter reads zero.

use crate::branch::{Branch, DeltaEntropy};
use crate::model::{EntropySource, Model};
use crate::progress::{ProgressReport, ProgressTicker};
use crate::radix_queue::DEFAULT_SEGMENTS;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::mpsc;
use std::time::Duration;

/// Combined outcome of a sharded run.
#[derive(Debug, Clone)]
pub struct ShardedCheckResult<S> {
    pub ok: bool,
    pub state_count: usize,
    pub branch_pop_count: u64,
    pub branch_push_count: u64,
    pub self_branch_count: u64,
    pub cross_shard_misses: u64,
    pub failing_trace: Option<Vec<S>>,
}

/// A cross-shard handoff entry: the predecessor snapshot the destination
/// shard should record in its `visited` map, paired with the branch to
/// enqueue. Carrying the predecessor across the mailbox, rather than
/// dropping it, keeps failing-trace reconstruction (`reconstruct`) working
/// for states first reached across a shard boundary.
type Batch<S, const SEGMENTS: usize> = Vec<(Option<S>, Branch<S, SEGMENTS>)>;

/// Runs `shard_count` local explorers over independent clones of `model`,
/// partitioning the reachable state space by `hash(snapshot) % shard_count`.
///
/// `M` must be `Clone` (one instance is built per shard) and `Send` (each
/// shard runs on its own OS thread); `M::State` must additionally be `Send`
/// to cross mailboxes.
pub fn check_sharded<M, const SEGMENTS: usize>(model: M, shard_count: usize) -> ShardedCheckResult<M::State>
where
    M: Model + Clone + Send,
    M::State: Send + std::fmt::Debug,
{
    assert!(shard_count > 0, "check_sharded requires at least one shard");
    if shard_count == 1 {
        let result = crate::checker::check::<M, SEGMENTS>(model);
        return ShardedCheckResult {
            ok: result.ok,
            state_count: result.state_count,
            branch_pop_count: result.branch_pop_count,
            branch_push_count: result.branch_push_count,
            self_branch_count: result.self_branch_count,
            cross_shard_misses: 0,
            failing_trace: result.failing_trace,
        };
    }

    let (senders, receivers): (Vec<_>, Vec<_>) = (0..shard_count)
        .map(|_| mpsc::channel::<Batch<M::State, SEGMENTS>>())
        .unzip();
    let pending = AtomicI64::new(1); // the initial state, owned by shard 0

    let partials: Vec<ShardPartial<M::State>> = std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(shard_count);
        let pending = &pending;
        let senders = &senders;
        for (id, receiver) in receivers.into_iter().enumerate() {
            let mut shard_model = model.clone();
            let senders = senders.clone();
            handles.push(scope.spawn(move || {
                run_shard::<M, SEGMENTS>(id, shard_count, &mut shard_model, senders, receiver, pending)
            }));
        }
        handles.into_iter().map(|h| h.join().expect("model-check shard panicked")).collect()
    });

    let mut state_count = 0usize;
    let mut branch_pop_count = 0u64;
    let mut branch_push_count = 0u64;
    let mut self_branch_count = 0u64;
    let mut cross_shard_misses = 0u64;
    let mut failing_trace = None;

    for partial in partials {
        state_count += partial.state_count;
        branch_pop_count += partial.branch_pop_count;
        branch_push_count += partial.branch_push_count;
        self_branch_count += partial.self_branch_count;
        cross_shard_misses += partial.cross_shard_misses;
        if let Some(trace) = partial.failing_trace {
            failing_trace.get_or_insert(trace);
        }
    }

    ShardedCheckResult {
        ok: failing_trace.is_none(),
        state_count,
        branch_pop_count,
        branch_push_count,
        self_branch_count,
        cross_shard_misses,
        failing_trace,
    }
}

struct ShardPartial<S> {
    state_count: usize,
    branch_pop_count: u64,
    branch_push_count: u64,
    self_branch_count: u64,
    cross_shard_misses: u64,
    failing_trace: Option<Vec<S>>,
}

fn shard_of<S: Hash>(state: &S, shard_count: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    state.hash(&mut hasher);
    (hasher.finish() as usize) % shard_count
}

#[allow(clippy::too_many_arguments)]
fn run_shard<M, const SEGMENTS: usize>(
    id: usize,
    shard_count: usize,
    model: &mut M,
    senders: Vec<mpsc::Sender<Batch<M::State, SEGMENTS>>>,
    receiver: mpsc::Receiver<Batch<M::State, SEGMENTS>>,
    pending: &AtomicI64,
) -> ShardPartial<M::State>
where
    M: Model,
    M::State: std::fmt::Debug,
{
    let mut visited: HashMap<M::State, Option<M::State>> = HashMap::new();
    let mut frontier: VecDeque<Branch<M::State, SEGMENTS>> = VecDeque::new();

    if id == 0 {
        let initial = model.initialize();
        visited.insert(initial.clone(), None);
        frontier.push_back(Branch::root(initial));
    }

    let mut outbox: Vec<Batch<M::State, SEGMENTS>> = (0..shard_count).map(|_| Vec::new()).collect();
    let mut state_count = usize::from(id == 0);
    let mut branch_pop_count = 0u64;
    let mut branch_push_count = 0u64;
    let mut self_branch_count = 0u64;
    let mut cross_shard_misses = 0u64;
    let mut ticker = ProgressTicker::new(ProgressTicker::default_interval());

    loop {
        while let Some(branch) = frontier.pop_front() {
            branch_pop_count += 1;
            pending.fetch_sub(1, Ordering::AcqRel);

            model.enter_state(&branch.snapshot);
            if !model.check_invariants() {
                return ShardPartial {
                    state_count,
                    branch_pop_count,
                    branch_push_count,
                    self_branch_count,
                    cross_shard_misses,
                    failing_trace: Some(reconstruct(&visited, branch.snapshot)),
                };
            }

            let mut delta = branch.delta.clone();
            let mut entropy = DeltaEntropy {
                delta: &mut delta,
                history: Default::default(),
                new_deltas: Vec::new(),
            };
            model.step(&mut entropy);
            let siblings = entropy.new_deltas;

            if !model.check_stepwise_invariants() {
                return ShardPartial {
                    state_count,
                    branch_pop_count,
                    branch_push_count,
                    self_branch_count,
                    cross_shard_misses,
                    failing_trace: Some(reconstruct(&visited, branch.snapshot)),
                };
            }

            let after = model.normalize(model.leave_state());

            if after == branch.snapshot {
                self_branch_count += 1;
            } else {
                let dest = shard_of(&after, shard_count);
                if dest == id {
                    if let std::collections::hash_map::Entry::Vacant(e) = visited.entry(after.clone()) {
                        e.insert(Some(branch.snapshot.clone()));
                        state_count += 1;
                        pending.fetch_add(1, Ordering::AcqRel);
                        frontier.push_back(Branch::root(after));
                    }
                } else {
                    pending.fetch_add(1, Ordering::AcqRel);
                    outbox[dest].push((Some(branch.snapshot.clone()), Branch::root(after)));
                }
            }

            for delta in siblings {
                branch_push_count += 1;
                pending.fetch_add(1, Ordering::AcqRel);
                frontier.push_back(Branch {
                    snapshot: branch.snapshot.clone(),
                    delta,
                });
            }

            if ticker.is_due() {
                model.report_progress(&ProgressReport {
                    state_count,
                    branch_pop_count,
                    branch_push_count,
                    self_branch_count,
                    elapsed: ticker.elapsed(),
                    cross_shard_misses,
                });
            }
        }

        for (dest, batch) in outbox.iter_mut().enumerate() {
            if dest != id && !batch.is_empty() {
                let _ = senders[dest].send(std::mem::take(batch));
            }
        }

        if pending.load(Ordering::Acquire) == 0 {
            match receiver.recv_timeout(Duration::from_millis(2)) {
                Ok(batch) => {
                    absorb(&mut visited, &mut frontier, batch, &mut state_count, &mut cross_shard_misses);
                    continue;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if pending.load(Ordering::Acquire) == 0 {
                        break;
                    }
                    continue;
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        match receiver.recv_timeout(Duration::from_millis(20)) {
            Ok(batch) => absorb(&mut visited, &mut frontier, batch, &mut state_count, &mut cross_shard_misses),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    ShardPartial {
        state_count,
        branch_pop_count,
        branch_push_count,
        self_branch_count,
        cross_shard_misses,
        failing_trace: None,
    }
}

fn absorb<S: Clone + Eq + Hash, const SEGMENTS: usize>(
    visited: &mut HashMap<S, Option<S>>,
    frontier: &mut VecDeque<Branch<S, SEGMENTS>>,
    batch: Batch<S, SEGMENTS>,
    state_count: &mut usize,
    cross_shard_misses: &mut u64,
) {
    for (predecessor, branch) in batch {
        if let std::collections::hash_map::Entry::Vacant(e) = visited.entry(branch.snapshot.clone()) {
            e.insert(predecessor);
            *state_count += 1;
            frontier.push_back(branch);
        } else {
            *cross_shard_misses += 1;
        }
    }
}

fn reconstruct<S: Clone + Eq + Hash>(visited: &HashMap<S, Option<S>>, failing: S) -> Vec<S> {
    let mut trace = vec![failing.clone()];
    let mut current = failing;
    while let Some(Some(pred)) = visited.get(&current) {
        trace.push(pred.clone());
        current = pred.clone();
    }
    trace.reverse();
    trace
}

/// Default entry point using the default radix-queue segment count.
pub fn check_sharded_default<M>(model: M, shard_count: usize) -> ShardedCheckResult<M::State>
where
    M: Model + Clone + Send,
    M::State: Send + std::fmt::Debug,
{
    check_sharded::<M, DEFAULT_SEGMENTS>(model, shard_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct BoundedCounter {
        max: i32,
        current: i32,
    }

    impl Model for BoundedCounter {
        type State = i32;

        fn initialize(&mut self) -> i32 {
            0
        }

        fn enter_state(&mut self, state: &i32) {
            self.current = *state;
        }

        fn step(&mut self, entropy: &mut dyn EntropySource) {
            let delta = entropy.pick_int(0, 1);
            if delta == 0 {
                self.current = (self.current - 1).max(0);
            } else {
                self.current = (self.current + 1).min(self.max);
            }
        }

        fn leave_state(&mut self) -> i32 {
            self.current
        }

        fn check_invariants(&self) -> bool {
            self.current >= 0 && self.current <= self.max
        }
    }

    #[test]
    fn sharded_matches_single_shard_state_count() {
        let single = crate::checker::check_default(BoundedCounter { max: 6, current: 0 });
        let sharded = check_sharded_default(BoundedCounter { max: 6, current: 0 }, 4);
        assert!(sharded.ok);
        assert_eq!(sharded.state_count, single.state_count);
    }

    #[test]
    fn single_shard_count_delegates_cleanly() {
        let result = check_sharded_default(BoundedCounter { max: 3, current: 0 }, 1);
        assert!(result.ok);
        assert_eq!(result.state_count, 4);
    }

    #[derive(Clone)]
    struct BrokenCounter {
        current: i32,
    }

    impl Model for BrokenCounter {
        type State = i32;

        fn initialize(&mut self) -> i32 {
            0
        }

        fn enter_state(&mut self, state: &i32) {
            self.current = *state;
        }

        fn step(&mut self, entropy: &mut dyn EntropySource) {
            let delta = entropy.pick_int(0, 1);
            self.current += if delta == 0 { -1 } else { 1 };
        }

        fn leave_state(&mut self) -> i32 {
            self.current
        }

        fn check_invariants(&self) -> bool {
            self.current >= 0
        }
    }

    #[test]
    fn failing_trace_survives_a_shard_hop() {
        let result = check_sharded_default(BrokenCounter { current: 0 }, 4);
        assert!(!result.ok);
        let trace = result.failing_trace.unwrap();
        assert_eq!(trace[0], 0);
        assert_eq!(*trace.last().unwrap(), -1);
    }
}
